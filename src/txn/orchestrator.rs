use super::log::TransactionLog;
use super::snapshot::SnapshotStore;
use super::TxnState;
use crate::config::ApplyOptions;
use crate::error::{Error, Result};
use crate::hasher::signature::{full_signature, hex_encode, HashAlgorithm};
use crate::planner::{ActionPlan, OpKind, Operation};
use crate::progress::ProgressReporter;
use crate::storage::models::OperationRow;
use crate::storage::Database;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const VERIFY_CHUNK_SIZE: usize = 64 * 1024;
const VERIFY_MMAP_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Result of applying one plan.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub transaction_id: i64,
    /// Operations that mutated the filesystem and were marked committed.
    pub committed: usize,
    /// Idempotent no-ops (already-applied operations re-applied safely).
    pub skipped: usize,
    pub state: TxnState,
    pub failure: Option<String>,
}

#[derive(Debug)]
pub struct RollbackOutcome {
    pub transaction_id: i64,
    pub restored: usize,
    pub skipped: usize,
}

enum StepResult {
    Mutated,
    /// The operation's effect was already present on disk.
    AlreadyApplied,
}

/// Drives a plan through the pending → committed/partially-failed →
/// rolled-back state machine.
///
/// Per-operation discipline: durably log the intent, verify the pre-image,
/// snapshot, mutate, mark committed. Any mid-plan failure flips the
/// transaction to PARTIALLY_FAILED and triggers an automatic rollback of
/// everything already executed.
pub struct Orchestrator<'a> {
    db: &'a Database,
    snapshot_root: PathBuf,
    options: ApplyOptions,
    /// Paths held by an in-flight apply; a second plan touching any of them
    /// is rejected with `PathLocked` instead of interleaving.
    locks: Mutex<HashSet<PathBuf>>,
}

impl<'a> Orchestrator<'a> {
    /// The database is escalated to `synchronous = FULL` so a log append is
    /// durable before any mutation it describes.
    pub fn new(db: &'a Database, snapshot_root: PathBuf, options: ApplyOptions) -> Result<Self> {
        db.set_full_synchronous()?;
        Ok(Self {
            db,
            snapshot_root,
            options,
            locks: Mutex::new(HashSet::new()),
        })
    }

    pub fn apply(
        &self,
        plan: &ActionPlan,
        cancel: &AtomicBool,
        reporter: &dyn ProgressReporter,
    ) -> Result<ApplyOutcome> {
        // Plans arriving from files may have been edited; re-check the path
        // conflict rules the planner enforces at build time.
        plan.validate()?;
        let _guard = self.acquire_locks(plan)?;
        let log = TransactionLog::new(self.db);
        let snapshots = SnapshotStore::new(self.db, self.snapshot_root.clone());

        let txn_id = log.begin()?;
        let deadline = self.options.commit_timeout.map(|t| Instant::now() + t);
        let mut committed = 0;
        let mut skipped = 0;

        for (seq, op) in plan.operations.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                return self.abort(txn_id, &log, reporter, committed, skipped, Error::Cancelled);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let e = Error::Timeout {
                        what: "transaction commit",
                    };
                    return self.abort(txn_id, &log, reporter, committed, skipped, e);
                }
            }

            match self.execute_one(&log, &snapshots, txn_id, seq as i64, op, plan.algorithm) {
                Ok(StepResult::Mutated) => committed += 1,
                Ok(StepResult::AlreadyApplied) => skipped += 1,
                Err(e) => {
                    error!(
                        "Transaction {} failed at step {} ('{}'): {}",
                        txn_id,
                        seq,
                        op.source.display(),
                        e
                    );
                    return self.abort(txn_id, &log, reporter, committed, skipped, e);
                }
            }
        }

        log.set_state(txn_id, TxnState::Committed)?;
        reporter.on_transaction_committed(txn_id);
        info!(
            "Transaction {} committed: {} operations ({} already applied)",
            txn_id, committed, skipped
        );
        Ok(ApplyOutcome {
            transaction_id: txn_id,
            committed,
            skipped,
            state: TxnState::Committed,
            failure: None,
        })
    }

    /// Write-ahead, snapshot, mutate, mark. The log append happens before
    /// the snapshot so a crash at any point leaves enough state to recover:
    /// an entry without a committed marker either did nothing or has a
    /// snapshot to restore from.
    fn execute_one(
        &self,
        log: &TransactionLog<'_>,
        snapshots: &SnapshotStore<'_>,
        txn_id: i64,
        seq: i64,
        op: &Operation,
        algorithm: HashAlgorithm,
    ) -> Result<StepResult> {
        let entry_id = log.append(txn_id, seq, op)?;

        if let Some(result) = self.already_applied(op, algorithm)? {
            log.mark_committed(entry_id)?;
            debug!(
                "Step {} of txn {} already applied ('{}')",
                seq,
                txn_id,
                op.source.display()
            );
            return Ok(result);
        }

        // The source exists and is about to be touched; its hash must still
        // match what the plan was built against.
        self.verify_pre_image(&op.source, algorithm, &op.expected_hash)?;

        let snapshot = snapshots.create(&op.source, op.kind)?;
        log.attach_snapshot(entry_id, snapshot.id)?;

        match op.kind {
            OpKind::Delete => {
                fs::remove_file(&op.source)?;
            }
            OpKind::Move => {
                let target = op.target.as_deref().ok_or_else(|| Error::PlanConflict {
                    path: op.source.clone(),
                })?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                move_file(&op.source, target)?;
            }
            OpKind::LinkReplace => {
                let target = op.target.as_deref().ok_or_else(|| Error::PlanConflict {
                    path: op.source.clone(),
                })?;
                // Link to a temp name first, then rename over the source, so
                // the source never disappears without a replacement present.
                let tmp = link_tmp_path(&op.source);
                if tmp.exists() {
                    fs::remove_file(&tmp)?;
                }
                fs::hard_link(target, &tmp)?;
                fs::rename(&tmp, &op.source)?;
            }
        }

        log.mark_committed(entry_id)?;
        Ok(StepResult::Mutated)
    }

    /// Detect operations whose effect already holds, so re-applying a plan
    /// after a partial run is a no-op rather than an error.
    fn already_applied(&self, op: &Operation, algorithm: HashAlgorithm) -> Result<Option<StepResult>> {
        match op.kind {
            OpKind::Delete => {
                if !op.source.exists() {
                    return Ok(Some(StepResult::AlreadyApplied));
                }
            }
            OpKind::Move => {
                if !op.source.exists() {
                    let target = op.target.as_deref().ok_or_else(|| Error::PlanConflict {
                        path: op.source.clone(),
                    })?;
                    // Only a no-op if the bytes actually landed at the target.
                    if target.exists() {
                        self.verify_pre_image(target, algorithm, &op.expected_hash)?;
                        return Ok(Some(StepResult::AlreadyApplied));
                    }
                    return Err(Error::Integrity {
                        path: op.source.clone(),
                        expected: op.expected_hash.clone(),
                        actual: "missing".to_string(),
                    });
                }
            }
            OpKind::LinkReplace => {
                let target = op.target.as_deref().ok_or_else(|| Error::PlanConflict {
                    path: op.source.clone(),
                })?;
                if op.source.exists() && same_inode(&op.source, target)? {
                    return Ok(Some(StepResult::AlreadyApplied));
                }
            }
        }
        Ok(None)
    }

    /// Refuse to touch a file whose content drifted since planning.
    fn verify_pre_image(
        &self,
        path: &Path,
        algorithm: HashAlgorithm,
        expected: &str,
    ) -> Result<()> {
        let size = fs::metadata(path)?.len();
        let actual_bytes = full_signature(
            path,
            size,
            algorithm,
            VERIFY_CHUNK_SIZE,
            VERIFY_MMAP_THRESHOLD,
            None,
        )?;
        let actual = hex_encode(&actual_bytes);
        if actual != expected {
            return Err(Error::Integrity {
                path: path.to_path_buf(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    fn abort(
        &self,
        txn_id: i64,
        log: &TransactionLog<'_>,
        reporter: &dyn ProgressReporter,
        committed: usize,
        skipped: usize,
        cause: Error,
    ) -> Result<ApplyOutcome> {
        log.set_state(txn_id, TxnState::PartiallyFailed)?;
        warn!(
            "Transaction {} partially failed after {} operations: {}",
            txn_id, committed, cause
        );

        match self.rollback_entries(txn_id) {
            Ok(_) => {
                log.set_state(txn_id, TxnState::RolledBack)?;
                reporter.on_transaction_rolled_back(txn_id);
                Ok(ApplyOutcome {
                    transaction_id: txn_id,
                    committed,
                    skipped,
                    state: TxnState::RolledBack,
                    failure: Some(cause.to_string()),
                })
            }
            Err(rollback_err) => {
                // The transaction stays PARTIALLY_FAILED and remains
                // rollback-eligible; snapshots are retained.
                error!(
                    "Rollback of transaction {} failed: {}",
                    txn_id, rollback_err
                );
                Ok(ApplyOutcome {
                    transaction_id: txn_id,
                    committed,
                    skipped,
                    state: TxnState::PartiallyFailed,
                    failure: Some(cause.to_string()),
                })
            }
        }
    }

    /// Undo a transaction by restoring snapshots in reverse log order.
    ///
    /// Valid from COMMITTED (user-requested undo), PARTIALLY_FAILED, and
    /// PENDING (crash leftovers). Restores are verified and idempotent, so
    /// rolling back an interrupted rollback converges to the same result.
    pub fn rollback(
        &self,
        txn_id: i64,
        reporter: &dyn ProgressReporter,
    ) -> Result<RollbackOutcome> {
        let log = TransactionLog::new(self.db);
        let row = log
            .transaction(txn_id)?
            .ok_or(Error::InvalidState {
                transaction_id: txn_id,
                state: "unknown".to_string(),
            })?;
        match TxnState::from_name(&row.state) {
            Some(TxnState::Committed) | Some(TxnState::PartiallyFailed) | Some(TxnState::Pending) => {}
            _ => {
                return Err(Error::InvalidState {
                    transaction_id: txn_id,
                    state: row.state,
                })
            }
        }

        let outcome = match self.rollback_entries(txn_id) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Partial rollback: record it and keep the transaction
                // eligible for another attempt. Never claim full success.
                log.set_state(txn_id, TxnState::PartiallyFailed)?;
                return Err(e);
            }
        };
        log.set_state(txn_id, TxnState::RolledBack)?;
        reporter.on_transaction_rolled_back(txn_id);
        info!(
            "Transaction {} rolled back: {} restored, {} skipped",
            txn_id, outcome.restored, outcome.skipped
        );
        Ok(outcome)
    }

    fn rollback_entries(&self, txn_id: i64) -> Result<RollbackOutcome> {
        let log = TransactionLog::new(self.db);
        let snapshots = SnapshotStore::new(self.db, self.snapshot_root.clone());
        let mut entries = log.entries_for(txn_id)?;
        entries.reverse();

        let mut restored = 0;
        let mut skipped = 0;
        for entry in &entries {
            match self.undo_entry(&snapshots, entry) {
                Ok(StepResult::Mutated) => restored += 1,
                Ok(StepResult::AlreadyApplied) => skipped += 1,
                Err(e) => {
                    // Report the subset restored, never a bare failure.
                    return Err(Error::RollbackIncomplete {
                        transaction_id: txn_id,
                        restored,
                        source: Box::new(e),
                    });
                }
            }
        }
        Ok(RollbackOutcome {
            transaction_id: txn_id,
            restored,
            skipped,
        })
    }

    fn undo_entry(
        &self,
        snapshots: &SnapshotStore<'_>,
        entry: &OperationRow,
    ) -> Result<StepResult> {
        let kind = OpKind::from_name(&entry.kind).ok_or_else(|| Error::InvalidState {
            transaction_id: entry.txn_id,
            state: format!("unknown operation kind '{}'", entry.kind),
        })?;

        match kind {
            OpKind::Delete | OpKind::LinkReplace => {
                // Restoring writes a fresh file into place, which also
                // breaks the hardlink a link-replace created.
                match entry.snapshot_id {
                    Some(snapshot_id) => {
                        snapshots.restore(snapshot_id)?;
                        Ok(StepResult::Mutated)
                    }
                    // Logged but never snapshotted: nothing was mutated.
                    None => Ok(StepResult::AlreadyApplied),
                }
            }
            OpKind::Move => {
                let source = PathBuf::from(&entry.source_path);
                let target = entry.target_path.as_deref().map(PathBuf::from);
                match target {
                    Some(target) if target.exists() && !source.exists() => {
                        if let Some(parent) = source.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        move_file(&target, &source)?;
                        Ok(StepResult::Mutated)
                    }
                    // Never executed, or already moved back.
                    _ => Ok(StepResult::AlreadyApplied),
                }
            }
        }
    }

    /// Roll back every transaction a previous process left unfinished: still
    /// PENDING, or holding log entries without a committed marker. Run this
    /// at startup before accepting new work.
    pub fn recover(&self, reporter: &dyn ProgressReporter) -> Result<Vec<RollbackOutcome>> {
        let log = TransactionLog::new(self.db);
        let unfinished = log.unfinished()?;
        if unfinished.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Recovering {} unfinished transaction(s): {:?}",
            unfinished.len(),
            unfinished
        );
        let mut outcomes = Vec::with_capacity(unfinished.len());
        for txn_id in unfinished {
            outcomes.push(self.rollback(txn_id, reporter)?);
        }
        Ok(outcomes)
    }

    fn acquire_locks(&self, plan: &ActionPlan) -> Result<PathLockGuard<'_, 'a>> {
        let mut wanted: Vec<PathBuf> = Vec::new();
        for op in &plan.operations {
            wanted.push(op.source.clone());
            if let Some(target) = &op.target {
                wanted.push(target.clone());
            }
        }

        let mut held = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        for path in &wanted {
            if held.contains(path) {
                return Err(Error::PathLocked { path: path.clone() });
            }
        }
        for path in &wanted {
            held.insert(path.clone());
        }
        drop(held);

        Ok(PathLockGuard {
            orchestrator: self,
            paths: wanted,
        })
    }
}

struct PathLockGuard<'o, 'a> {
    orchestrator: &'o Orchestrator<'a>,
    paths: Vec<PathBuf>,
}

impl Drop for PathLockGuard<'_, '_> {
    fn drop(&mut self) {
        let mut held = self
            .orchestrator
            .locks
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        for path in &self.paths {
            held.remove(path);
        }
    }
}

/// Rename, falling back to copy + remove when source and target live on
/// different filesystems.
fn move_file(source: &Path, target: &Path) -> std::io::Result<()> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(source, target)?;
            fs::remove_file(source)
        }
    }
}

fn link_tmp_path(source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "link".to_string());
    source.with_file_name(format!(".{}.link-tmp", name))
}

#[cfg(unix)]
fn same_inode(a: &Path, b: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let ma = fs::metadata(a)?;
    let mb = fs::metadata(b)?;
    Ok(ma.ino() == mb.ino() && ma.dev() == mb.dev())
}

#[cfg(not(unix))]
fn same_inode(_a: &Path, _b: &Path) -> std::io::Result<bool> {
    Ok(false)
}
