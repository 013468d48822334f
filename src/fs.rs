//! Disk abstraction used by the scanner and builder.
//!
//! Timestamps are signed 64-bit milliseconds. A missing file is modeled as
//! `MTime::Missing` rather than a zero stamp, and stat errors surface as
//! `Err(io::Error)` rather than a sentinel value.

use std::io;
use std::path::Path;

/// MTime info gathered for a file. This also models "file is absent".
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MTime {
    Missing,
    Stamp(i64),
}

impl MTime {
    /// The log encoding: 0 means missing.
    pub fn raw(self) -> i64 {
        match self {
            MTime::Missing => 0,
            MTime::Stamp(t) => t,
        }
    }

    pub fn from_raw(t: i64) -> MTime {
        if t == 0 {
            MTime::Missing
        } else {
            MTime::Stamp(t)
        }
    }

    pub fn exists(self) -> bool {
        matches!(self, MTime::Stamp(_))
    }
}

/// Everything the engine observes or changes on disk goes through this trait,
/// so tests can substitute an in-memory filesystem.
pub trait DiskInterface: Sync {
    /// stat() an on-disk path, following symlinks.
    fn stat(&self, path: &str) -> io::Result<MTime>;
    /// lstat() an on-disk path; also reports whether it is a directory.
    fn lstat(&self, path: &str) -> io::Result<(MTime, bool)>;
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;
    fn write_file(&self, path: &str, content: &[u8]) -> io::Result<()>;
    /// Create the directories containing `path`.
    fn make_dirs_for(&self, path: &str) -> io::Result<()>;
    /// Returns whether the file existed.
    fn remove_file(&self, path: &str) -> io::Result<bool>;
    /// Whether stat()/lstat() may be called from multiple threads at once.
    fn is_stat_thread_safe(&self) -> bool;
}

#[cfg(unix)]
fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mtime() * 1000 + meta.mtime_nsec() / 1_000_000
}

#[cfg(not(unix))]
fn mtime_millis(meta: &std::fs::Metadata) -> i64 {
    match meta.modified() {
        Ok(time) => match time.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(_) => 0,
        },
        Err(_) => 0,
    }
}

#[derive(Default)]
pub struct RealDisk {}

impl RealDisk {
    pub fn new() -> Self {
        RealDisk {}
    }
}

impl DiskInterface for RealDisk {
    fn stat(&self, path: &str) -> io::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(MTime::Stamp(mtime_millis(&meta))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(err),
        }
    }

    fn lstat(&self, path: &str) -> io::Result<(MTime, bool)> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => Ok((MTime::Stamp(mtime_millis(&meta)), meta.is_dir())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok((MTime::Missing, false)),
            Err(err) => Err(err),
        }
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&self, path: &str, content: &[u8]) -> io::Result<()> {
        std::fs::write(path, content)
    }

    fn make_dirs_for(&self, path: &str) -> io::Result<()> {
        match Path::new(path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }

    fn remove_file(&self, path: &str) -> io::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn is_stat_thread_safe(&self) -> bool {
        true
    }
}
