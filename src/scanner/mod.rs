use std::path::PathBuf;

mod walk;

pub use walk::{walk, WalkOutcome};

/// One discovered filesystem entry.
///
/// Identity is the path at scan time; records are owned transiently by the
/// scan pipeline. A record with `error` set was seen but could not be fully
/// read (traversal or hashing failure) and is excluded from grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    /// Modification time as nanoseconds since the unix epoch. Subsecond
    /// precision matters: the hash cache key would otherwise go stale.
    pub mtime_ns: i64,
    pub error: Option<String>,
}

impl FileRecord {
    pub fn new(path: PathBuf, size: u64, mtime_ns: i64) -> Self {
        Self {
            path,
            size,
            mtime_ns,
            error: None,
        }
    }

    pub fn with_error(path: PathBuf, message: String) -> Self {
        Self {
            path,
            size: 0,
            mtime_ns: 0,
            error: Some(message),
        }
    }
}

pub(crate) fn mtime_ns_from_metadata(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
