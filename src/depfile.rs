//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers.
//!
//! The accepted grammar is small: any number of `target: dep dep...` rules,
//! with backslash-newline continuations. Both LF and CRLF line endings are
//! accepted, because cross-compilers emit either.

use crate::smallmap::SmallMap;

/// Parse failure, positioned at the byte where parsing stopped.
#[derive(Debug)]
pub struct ParseError {
    msg: &'static str,
    ofs: usize,
}

impl ParseError {
    /// Render the error with line and column context for diagnostics.
    pub fn format(&self, filename: &str, buf: &[u8]) -> String {
        let before = &buf[..self.ofs.min(buf.len())];
        let line = 1 + before.iter().filter(|&&c| c == b'\n').count();
        let line_start = before
            .iter()
            .rposition(|&c| c == b'\n')
            .map_or(0, |pos| pos + 1);
        format!(
            "{}:{}:{}: {}",
            filename,
            line,
            self.ofs - line_start + 1,
            self.msg
        )
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.buf.get(self.pos + 1).copied()
    }

    fn error<T>(&self, msg: &'static str) -> Result<T, ParseError> {
        Err(ParseError { msg, ofs: self.pos })
    }

    /// A backslash immediately before a line ending continues the rule.
    fn at_escaped_newline(&self) -> bool {
        self.peek() == Some(b'\\')
            && (self.peek2() == Some(b'\n')
                || (self.peek2() == Some(b'\r') && self.buf.get(self.pos + 2) == Some(&b'\n')))
    }

    /// Consume spaces and escaped newlines between tokens of one rule.
    fn skip_blank(&mut self) {
        loop {
            if self.peek() == Some(b' ') {
                self.pos += 1;
            } else if self.at_escaped_newline() {
                self.pos += if self.peek2() == Some(b'\r') { 3 } else { 2 };
            } else {
                break;
            }
        }
    }

    /// Consume any whitespace between rules.
    fn skip_break(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\n') | Some(b'\r')) {
            self.pos += 1;
        }
    }

    /// Lex one path token. Colons count as path characters (Windows drive
    /// letters), so a target token usually arrives with its ':' attached.
    /// Backslashes stay in the token unless they escape a newline.
    fn token(&mut self) -> Option<&'a str> {
        self.skip_blank();
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\n' => break,
                b'\r' if self.peek2() == Some(b'\n') => break,
                b'\\' if self.at_escaped_newline() => break,
                _ => self.pos += 1,
            }
        }
        (self.pos > start).then(|| {
            // Safety: token boundaries fall on ASCII bytes, so UTF-8 input
            // yields valid UTF-8 slices.
            unsafe { std::str::from_utf8_unchecked(&self.buf[start..self.pos]) }
        })
    }
}

/// Parse a `.d` file into a map of target to the inputs it depends on.
pub fn parse(buf: &[u8]) -> Result<SmallMap<&str, Vec<&str>>, ParseError> {
    let mut cur = Cursor { buf, pos: 0 };
    let mut rules = SmallMap::new();
    loop {
        cur.skip_break();
        let Some(target) = cur.token() else {
            break;
        };
        let target = match target.strip_suffix(':') {
            Some(stripped) => stripped,
            None => {
                // The colon may stand apart from the target.
                cur.skip_blank();
                if cur.peek() != Some(b':') {
                    return cur.error("expected ':' after target");
                }
                cur.pos += 1;
                target
            }
        };
        let mut deps = Vec::new();
        while let Some(dep) = cur.token() {
            deps.push(dep);
        }
        rules.insert(target, deps);
    }
    Ok(rules)
}
