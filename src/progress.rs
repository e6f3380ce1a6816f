use crate::index::DuplicateGroup;
use crate::scanner::FileRecord;

/// Trait for reporting pipeline progress and transaction lifecycle events.
///
/// Collaborators (CLI, RPC server) implement this once and pass it in at
/// construction time. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_scan_start(&self) {}
    fn on_file_processed(&self, _record: &FileRecord) {}
    fn on_hash_start(&self) {}
    fn on_hash_complete(&self, _duplicate_files: usize, _duration_secs: f64) {}
    fn on_scan_complete(&self, _groups: &[DuplicateGroup], _duration_secs: f64) {}
    fn on_transaction_committed(&self, _transaction_id: i64) {}
    fn on_transaction_rolled_back(&self, _transaction_id: i64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
