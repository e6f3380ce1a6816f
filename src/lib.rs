//! Safe file deduplication core.
//!
//! The pipeline runs in two halves. The read-only half walks directory
//! trees, buckets files by size, narrows candidates with a quick prefix
//! signature, confirms duplicates with a full content hash, and turns the
//! confirmed groups into a serializable action plan — nothing on disk is
//! touched. The mutating half applies a plan under a write-ahead
//! transaction log with content-addressed snapshots of every file before it
//! is modified, so any applied transaction can be rolled back and any crash
//! can be recovered from.

pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod index;
pub mod planner;
pub mod progress;
pub mod scanner;
pub mod storage;
pub mod txn;

pub use config::{AppConfig, ApplyOptions, RetentionPolicy, ScanOptions};
pub use engine::{ScanEngine, ScanOutcome, ScanStats};
pub use error::{Error, Result};
pub use hasher::{HashAlgorithm, HashCache};
pub use index::{ContentIndex, DuplicateGroup};
pub use planner::{build_plan, ActionPlan, DedupStrategy, OpKind, Operation, PlanOptions};
pub use progress::{ProgressReporter, SilentReporter};
pub use storage::Database;
pub use txn::{
    ApplyOutcome, Orchestrator, RollbackOutcome, SnapshotStore, TransactionLog, TxnState,
};
