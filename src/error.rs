use std::path::PathBuf;
use thiserror::Error;

/// Closed error taxonomy for the dedup core.
///
/// Traversal and hashing errors are recoverable per-file and are reported
/// through the scan outcome rather than this type; the variants here are the
/// ones that stop an operation.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Plan serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error hashing '{path}': {source}")]
    Hash {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Integrity check failed for '{path}': expected {expected}, got {actual}")]
    Integrity {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Failed to durably append to transaction log: {0}")]
    WalAppend(String),

    #[error("Plan path conflict on '{path}'")]
    PlanConflict { path: PathBuf },

    #[error("Path '{path}' is locked by an in-flight transaction")]
    PathLocked { path: PathBuf },

    #[error("Transaction {transaction_id} is in state '{state}', operation not valid")]
    InvalidState {
        transaction_id: i64,
        state: String,
    },

    #[error(
        "Rollback of transaction {transaction_id} incomplete: \
         {restored} operation(s) restored before failing: {source}"
    )]
    RollbackIncomplete {
        transaction_id: i64,
        restored: usize,
        source: Box<Error>,
    },

    #[error("Snapshot {id} not found")]
    SnapshotMissing { id: i64 },

    #[error("Snapshot {id} is referenced by a rollback-eligible transaction")]
    SnapshotInUse { id: i64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout during {what}")]
    Timeout { what: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
