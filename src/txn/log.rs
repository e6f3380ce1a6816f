use super::TxnState;
use crate::error::{Error, Result};
use crate::planner::Operation;
use crate::storage::models::{OperationRow, TransactionRow};
use crate::storage::Database;
use tracing::debug;

/// Append-only, durable, time-ordered record of intended operations.
///
/// The backing database runs `synchronous = FULL`, so every append commits
/// to durable storage before this returns — the write-ahead barrier the
/// orchestrator relies on. An append failure is fail-closed: the caller
/// must abort before mutating anything.
pub struct TransactionLog<'a> {
    db: &'a Database,
}

impl<'a> TransactionLog<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn begin(&self) -> Result<i64> {
        let txn_id = self.db.create_transaction(TxnState::Pending.as_str())?;
        debug!("Transaction {} begun", txn_id);
        Ok(txn_id)
    }

    /// Durably record the intent to execute `op` as step `seq`. Returns the
    /// log entry id.
    pub fn append(&self, txn_id: i64, seq: i64, op: &Operation) -> Result<i64> {
        self.db
            .append_operation(
                txn_id,
                seq,
                op.kind.as_str(),
                &op.source.to_string_lossy(),
                op.target.as_deref().map(|p| p.to_string_lossy().into_owned()).as_deref(),
                &op.expected_hash,
            )
            .map_err(|e| Error::WalAppend(e.to_string()))
    }

    pub fn attach_snapshot(&self, entry_id: i64, snapshot_id: i64) -> Result<()> {
        self.db
            .attach_snapshot_to_operation(entry_id, snapshot_id)
            .map_err(|e| Error::WalAppend(e.to_string()))
    }

    pub fn mark_committed(&self, entry_id: i64) -> Result<()> {
        self.db.mark_operation_committed(entry_id)?;
        Ok(())
    }

    pub fn set_state(&self, txn_id: i64, state: TxnState) -> Result<()> {
        let completed = !matches!(state, TxnState::Pending);
        self.db
            .set_transaction_state(txn_id, state.as_str(), completed)?;
        debug!("Transaction {} → {}", txn_id, state.as_str());
        Ok(())
    }

    pub fn transaction(&self, txn_id: i64) -> Result<Option<TransactionRow>> {
        Ok(self.db.get_transaction(txn_id)?)
    }

    pub fn entries_for(&self, txn_id: i64) -> Result<Vec<OperationRow>> {
        Ok(self.db.operations_for(txn_id)?)
    }

    pub fn list_transactions(&self) -> Result<Vec<TransactionRow>> {
        Ok(self.db.list_transactions()?)
    }

    /// Transactions left behind by a crash: still PENDING, or holding log
    /// entries without a committed marker.
    pub fn unfinished(&self) -> Result<Vec<i64>> {
        Ok(self.db.unfinished_transactions()?)
    }
}
