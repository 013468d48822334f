//! Extraction of headers from MSVC `cl.exe /showIncludes` output.
//!
//! Each include is reported on its own line, prefixed with a locale-dependent
//! marker. Matched lines are removed from the output before it reaches the
//! user; the remaining lines pass through untouched.

/// The prefix cl.exe emits in the English locale; rules targeting other
/// locales declare their own.
pub const DEFAULT_PREFIX: &str = "Note: including file:";

pub struct ShowIncludes {
    /// Unique include paths, in first-appearance order.
    pub includes: Vec<String>,
    /// Command output with the `/showIncludes` lines stripped.
    pub filtered: Vec<u8>,
}

/// Split `output` into include paths and remaining output.
pub fn parse(output: &[u8], prefix: &str) -> ShowIncludes {
    let mut includes: Vec<String> = Vec::new();
    let mut filtered = Vec::with_capacity(output.len());

    for line in output.split_inclusive(|&c| c == b'\n') {
        let text = line
            .strip_suffix(b"\r\n")
            .or_else(|| line.strip_suffix(b"\n"))
            .unwrap_or(line);
        if let Some(rest) = text.strip_prefix(prefix.as_bytes()) {
            let path = String::from_utf8_lossy(rest).trim().to_string();
            if !path.is_empty() && !includes.iter().any(|p| *p == path) {
                includes.push(path);
            }
        } else {
            filtered.extend_from_slice(line);
        }
    }

    ShowIncludes { includes, filtered }
}
