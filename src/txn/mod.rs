//! Transactional safety layer: write-ahead log, content-addressed
//! snapshots, and the apply/rollback orchestrator.

pub mod log;
pub mod orchestrator;
pub mod snapshot;

pub use log::TransactionLog;
pub use orchestrator::{ApplyOutcome, Orchestrator, RollbackOutcome};
pub use snapshot::SnapshotStore;

/// Transaction lifecycle: PENDING → {COMMITTED | PARTIALLY_FAILED} →
/// [ROLLED_BACK]. Transactions are destroyed only by explicit retention
/// cleanup, never silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Pending,
    Committed,
    PartiallyFailed,
    RolledBack,
}

impl TxnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxnState::Pending => "pending",
            TxnState::Committed => "committed",
            TxnState::PartiallyFailed => "partially_failed",
            TxnState::RolledBack => "rolled_back",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "pending" => Some(TxnState::Pending),
            "committed" => Some(TxnState::Committed),
            "partially_failed" => Some(TxnState::PartiallyFailed),
            "rolled_back" => Some(TxnState::RolledBack),
            _ => None,
        }
    }
}
