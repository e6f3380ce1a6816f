/// A file discovered during scanning, as persisted.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub id: i64,
    pub path: String,
    pub file_size: i64,
    pub mtime_ns: i64,
    pub quick_hash: Option<i64>,
    pub full_hash: Option<Vec<u8>>,
    pub last_seen_at: String,
}

/// Hash cache entry row: signature keyed by path, validated by size+mtime.
#[derive(Debug, Clone)]
pub struct SignatureRow {
    pub path: String,
    pub file_size: i64,
    pub mtime_ns: i64,
    pub algorithm: String,
    pub quick_hash: i64,
    pub full_hash: Option<Vec<u8>>,
    pub updated_at: String,
}

/// A persisted group of files sharing one full content hash.
#[derive(Debug, Clone)]
pub struct DuplicateGroupRow {
    pub id: i64,
    pub full_hash: Vec<u8>,
    pub algorithm: String,
    pub file_size: i64,
    pub file_count: i64,
    pub wasted_bytes: i64,
}

/// One tracked transaction.
#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub id: i64,
    pub state: String,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Write-ahead log entry: appended and flushed before the corresponding
/// mutation executes.
#[derive(Debug, Clone)]
pub struct OperationRow {
    pub id: i64,
    pub txn_id: i64,
    pub seq: i64,
    pub kind: String,
    pub source_path: String,
    pub target_path: Option<String>,
    pub pre_hash: String,
    pub snapshot_id: Option<i64>,
    pub logged_at: String,
    pub committed: bool,
}

/// Reversible pre-mutation state. The payload (when present) lives
/// content-addressed on disk; `content_hash` points at it.
#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub id: i64,
    pub kind: String,
    pub content_hash: Option<String>,
    pub original_path: String,
    pub file_size: i64,
    pub mode: Option<u32>,
    pub mtime_ns: Option<i64>,
    pub created_at: String,
    pub restored_at: Option<String>,
}
