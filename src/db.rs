//! Durable logs of previous builds: the build log (per output, the mtime and
//! command hash observed when it was produced) and the deps log (per output,
//! the implicit inputs discovered at build time).
//!
//! Both are line-oriented, append-only files with a version header, loaded
//! last-record-wins so an interrupted append only loses its own record.
//! Paths containing tabs are not representable.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};

use anyhow::Context;

use crate::fs::MTime;

const BUILD_LOG_HEADER: &str = "# joist build log v1";
const DEPS_LOG_HEADER: &str = "# joist deps log v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLogEntry {
    pub start_ms: i64,
    pub end_ms: i64,
    /// Output mtime recorded at the end of the command, 0 when missing.
    pub mtime: i64,
    pub command_hash: u64,
}

/// Per-output record of the last successful command.
#[derive(Default)]
pub struct BuildLog {
    entries: hashbrown::HashMap<String, BuildLogEntry, ahash::RandomState>,
    file: Option<BufWriter<File>>,
}

fn parse_build_line(line: &str) -> Option<(String, BuildLogEntry)> {
    let mut fields = line.split('\t');
    let start_ms = fields.next()?.parse().ok()?;
    let end_ms = fields.next()?.parse().ok()?;
    let mtime = fields.next()?.parse().ok()?;
    let output = fields.next()?;
    let command_hash = u64::from_str_radix(fields.next()?, 16).ok()?;
    Some((
        output.to_string(),
        BuildLogEntry {
            start_ms,
            end_ms,
            mtime,
            command_hash,
        },
    ))
}

impl BuildLog {
    /// An in-memory log that never persists; used by tests and dry runs.
    pub fn new() -> BuildLog {
        BuildLog::default()
    }

    /// Open an on-disk log, creating it when absent.
    pub fn open(path: &str) -> anyhow::Result<BuildLog> {
        let mut log = BuildLog::new();
        match std::fs::OpenOptions::new().read(true).append(true).open(path) {
            Ok(mut f) => {
                for line in BufReader::new(&mut f).lines() {
                    let line = line.with_context(|| format!("reading {}", path))?;
                    if line.starts_with('#') {
                        continue;
                    }
                    // Tolerate truncated trailing records.
                    if let Some((output, entry)) = parse_build_line(&line) {
                        log.entries.insert(output, entry);
                    }
                }
                log.file = Some(BufWriter::new(f));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let mut f = File::create(path).with_context(|| format!("create {}", path))?;
                writeln!(f, "{}", BUILD_LOG_HEADER)?;
                log.file = Some(BufWriter::new(f));
            }
            Err(err) => return Err(err).with_context(|| format!("open {}", path)),
        }
        Ok(log)
    }

    pub fn lookup(&self, output: &str) -> Option<&BuildLogEntry> {
        self.entries.get(output)
    }

    pub fn record_command(
        &mut self,
        output: &str,
        start_ms: i64,
        end_ms: i64,
        mtime: MTime,
        command_hash: u64,
    ) -> io::Result<()> {
        let entry = BuildLogEntry {
            start_ms,
            end_ms,
            mtime: mtime.raw(),
            command_hash,
        };
        if let Some(f) = &mut self.file {
            writeln!(
                f,
                "{}\t{}\t{}\t{}\t{:x}",
                entry.start_ms, entry.end_ms, entry.mtime, output, entry.command_hash
            )?;
            f.flush()?;
        }
        self.entries.insert(output.to_string(), entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepsEntry {
    /// Output mtime at the moment the deps were recorded, 0 when missing.
    pub mtime: i64,
    pub deps: Vec<String>,
}

/// Per-output record of build-time discovered implicit inputs.
#[derive(Default)]
pub struct DepsLog {
    entries: hashbrown::HashMap<String, DepsEntry, ahash::RandomState>,
    file: Option<BufWriter<File>>,
}

fn parse_deps_line(line: &str) -> Option<(String, DepsEntry)> {
    let mut fields = line.split('\t');
    let mtime = fields.next()?.parse().ok()?;
    let output = fields.next()?;
    let deps = fields.map(str::to_string).collect();
    Some((output.to_string(), DepsEntry { mtime, deps }))
}

impl DepsLog {
    pub fn new() -> DepsLog {
        DepsLog::default()
    }

    pub fn open(path: &str) -> anyhow::Result<DepsLog> {
        let mut log = DepsLog::new();
        match std::fs::OpenOptions::new().read(true).append(true).open(path) {
            Ok(mut f) => {
                for line in BufReader::new(&mut f).lines() {
                    let line = line.with_context(|| format!("reading {}", path))?;
                    if line.starts_with('#') {
                        continue;
                    }
                    if let Some((output, entry)) = parse_deps_line(&line) {
                        log.entries.insert(output, entry);
                    }
                }
                log.file = Some(BufWriter::new(f));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let mut f = File::create(path).with_context(|| format!("create {}", path))?;
                writeln!(f, "{}", DEPS_LOG_HEADER)?;
                log.file = Some(BufWriter::new(f));
            }
            Err(err) => return Err(err).with_context(|| format!("open {}", path)),
        }
        Ok(log)
    }

    pub fn get_deps(&self, output: &str) -> Option<&DepsEntry> {
        self.entries.get(output)
    }

    /// Record deps for an output. Returns false when the stored entry already
    /// matches and the write was skipped.
    pub fn record_deps(
        &mut self,
        output: &str,
        mtime: MTime,
        deps: Vec<String>,
    ) -> io::Result<bool> {
        let entry = DepsEntry {
            mtime: mtime.raw(),
            deps,
        };
        if self.entries.get(output) == Some(&entry) {
            return Ok(false);
        }
        if let Some(f) = &mut self.file {
            write!(f, "{}\t{}", entry.mtime, output)?;
            for dep in &entry.deps {
                write!(f, "\t{}", dep)?;
            }
            writeln!(f)?;
            f.flush()?;
        }
        self.entries.insert(output.to_string(), entry);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_log_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("build.log");
        let path = path.to_str().unwrap();

        let mut log = BuildLog::open(path)?;
        log.record_command("out", 0, 10, MTime::Stamp(123), 0xdead_beef)?;
        log.record_command("other", 5, 6, MTime::Missing, 7)?;
        // Later record for the same output wins.
        log.record_command("out", 20, 30, MTime::Stamp(456), 0xcafe)?;
        drop(log);

        let log = BuildLog::open(path)?;
        assert_eq!(log.len(), 2);
        let entry = log.lookup("out").unwrap();
        assert_eq!(entry.mtime, 456);
        assert_eq!(entry.command_hash, 0xcafe);
        assert_eq!(entry.start_ms, 20);
        assert_eq!(log.lookup("other").unwrap().mtime, 0);
        assert!(log.lookup("absent").is_none());
        Ok(())
    }

    #[test]
    fn deps_log_roundtrip_and_dedup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("deps.log");
        let path = path.to_str().unwrap();

        let mut log = DepsLog::open(path)?;
        let deps = vec!["a.h".to_string(), "b.h".to_string()];
        assert!(log.record_deps("out", MTime::Stamp(9), deps.clone())?);
        // Identical record is skipped.
        assert!(!log.record_deps("out", MTime::Stamp(9), deps.clone())?);
        // Changed mtime writes again.
        assert!(log.record_deps("out", MTime::Stamp(10), deps)?);
        drop(log);

        let log = DepsLog::open(path)?;
        let entry = log.get_deps("out").unwrap();
        assert_eq!(entry.mtime, 10);
        assert_eq!(entry.deps, vec!["a.h", "b.h"]);
        Ok(())
    }

    #[test]
    fn in_memory_logs() {
        let mut log = BuildLog::new();
        log.record_command("x", 0, 1, MTime::Stamp(2), 3).unwrap();
        assert!(log.lookup("x").is_some());
    }
}
