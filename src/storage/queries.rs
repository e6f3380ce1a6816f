use super::models::*;
use super::sqlite::Database;
use rusqlite::{params, OptionalExtension, Result};
use tracing::debug;

impl Database {
    // ── Scanned Files ────────────────────────────────────────────

    pub fn upsert_scanned_files(&self, files: &[ScannedFile]) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO scanned_file \
                 (path, file_size, mtime_ns, quick_hash, full_hash, last_seen_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(path) DO UPDATE SET \
                     file_size = excluded.file_size, \
                     mtime_ns = excluded.mtime_ns, \
                     quick_hash = excluded.quick_hash, \
                     full_hash = excluded.full_hash, \
                     last_seen_at = excluded.last_seen_at",
            )?;
            for file in files {
                count += stmt.execute(params![
                    file.path,
                    file.file_size,
                    file.mtime_ns,
                    file.quick_hash,
                    file.full_hash,
                    file.last_seen_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Upserted {} scanned files", count);
        Ok(count)
    }

    // ── Signatures (hash cache persistence) ──────────────────────

    pub fn load_signatures(&self) -> Result<Vec<SignatureRow>> {
        let mut stmt = self.connection().prepare(
            "SELECT path, file_size, mtime_ns, algorithm, quick_hash, full_hash, updated_at \
             FROM file_signature",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SignatureRow {
                    path: row.get(0)?,
                    file_size: row.get(1)?,
                    mtime_ns: row.get(2)?,
                    algorithm: row.get(3)?,
                    quick_hash: row.get(4)?,
                    full_hash: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn upsert_signatures(&self, rows: &[SignatureRow]) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO file_signature \
                 (path, file_size, mtime_ns, algorithm, quick_hash, full_hash, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(path) DO UPDATE SET \
                     file_size = excluded.file_size, \
                     mtime_ns = excluded.mtime_ns, \
                     algorithm = excluded.algorithm, \
                     quick_hash = excluded.quick_hash, \
                     full_hash = excluded.full_hash, \
                     updated_at = excluded.updated_at",
            )?;
            for row in rows {
                count += stmt.execute(params![
                    row.path,
                    row.file_size,
                    row.mtime_ns,
                    row.algorithm,
                    row.quick_hash,
                    row.full_hash,
                    row.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    // ── Duplicate Groups ─────────────────────────────────────────

    /// Replace all duplicate groups with the result of the current scan.
    /// Each entry is (full_hash, algorithm, file_size, member paths).
    pub fn replace_duplicate_groups(
        &self,
        groups: &[(Vec<u8>, String, i64, Vec<String>)],
    ) -> Result<usize> {
        let tx = self.connection().unchecked_transaction()?;
        tx.execute("DELETE FROM duplicate_group", [])?;
        let mut group_count = 0;
        {
            let mut group_stmt = tx.prepare_cached(
                "INSERT INTO duplicate_group \
                 (full_hash, algorithm, file_size, file_count, wasted_bytes, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut member_stmt = tx.prepare_cached(
                "INSERT INTO duplicate_group_member (group_id, file_id) \
                 SELECT ?1, id FROM scanned_file WHERE path = ?2",
            )?;

            let now = chrono::Utc::now().to_rfc3339();
            for (full_hash, algorithm, file_size, paths) in groups {
                let file_count = paths.len() as i64;
                let wasted_bytes = file_size * (file_count - 1);
                group_stmt.execute(params![
                    full_hash,
                    algorithm,
                    file_size,
                    file_count,
                    wasted_bytes,
                    now
                ])?;
                let group_id = tx.last_insert_rowid();
                for path in paths {
                    member_stmt.execute(params![group_id, path])?;
                }
                group_count += 1;
            }
        }
        tx.commit()?;
        debug!("Stored {} duplicate groups", group_count);
        Ok(group_count)
    }

    pub fn get_duplicate_groups(&self, offset: i64, limit: i64) -> Result<Vec<DuplicateGroupRow>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, full_hash, algorithm, file_size, file_count, wasted_bytes \
             FROM duplicate_group \
             ORDER BY wasted_bytes DESC LIMIT ?1 OFFSET ?2",
        )?;
        let groups = stmt
            .query_map(params![limit, offset], |row| {
                Ok(DuplicateGroupRow {
                    id: row.get(0)?,
                    full_hash: row.get(1)?,
                    algorithm: row.get(2)?,
                    file_size: row.get(3)?,
                    file_count: row.get(4)?,
                    wasted_bytes: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(groups)
    }

    pub fn get_files_in_group(&self, group_id: i64) -> Result<Vec<ScannedFile>> {
        let mut stmt = self.connection().prepare(
            "SELECT sf.id, sf.path, sf.file_size, sf.mtime_ns, sf.quick_hash, sf.full_hash, \
                    sf.last_seen_at \
             FROM scanned_file sf \
             JOIN duplicate_group_member dgm ON sf.id = dgm.file_id \
             WHERE dgm.group_id = ?1",
        )?;
        let files = stmt
            .query_map(params![group_id], |row| {
                Ok(ScannedFile {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    file_size: row.get(2)?,
                    mtime_ns: row.get(3)?,
                    quick_hash: row.get(4)?,
                    full_hash: row.get(5)?,
                    last_seen_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(files)
    }

    pub fn get_total_wasted_bytes(&self) -> Result<i64> {
        self.connection().query_row(
            "SELECT COALESCE(SUM(wasted_bytes), 0) FROM duplicate_group",
            [],
            |row| row.get(0),
        )
    }

    // ── Transactions ─────────────────────────────────────────────

    pub fn create_transaction(&self, state: &str) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "INSERT INTO txn (state, started_at) VALUES (?1, ?2)",
            params![state, now],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn set_transaction_state(&self, txn_id: i64, state: &str, completed: bool) -> Result<()> {
        if completed {
            let now = chrono::Utc::now().to_rfc3339();
            self.connection().execute(
                "UPDATE txn SET state = ?1, completed_at = ?2 WHERE id = ?3",
                params![state, now, txn_id],
            )?;
        } else {
            self.connection().execute(
                "UPDATE txn SET state = ?1 WHERE id = ?2",
                params![state, txn_id],
            )?;
        }
        Ok(())
    }

    pub fn get_transaction(&self, txn_id: i64) -> Result<Option<TransactionRow>> {
        self.connection()
            .query_row(
                "SELECT id, state, started_at, completed_at FROM txn WHERE id = ?1",
                params![txn_id],
                |row| {
                    Ok(TransactionRow {
                        id: row.get(0)?,
                        state: row.get(1)?,
                        started_at: row.get(2)?,
                        completed_at: row.get(3)?,
                    })
                },
            )
            .optional()
    }

    pub fn list_transactions(&self) -> Result<Vec<TransactionRow>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, state, started_at, completed_at FROM txn ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TransactionRow {
                    id: row.get(0)?,
                    state: row.get(1)?,
                    started_at: row.get(2)?,
                    completed_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Transactions whose log shows operations without a committed marker,
    /// or that never left PENDING — rollback candidates after a crash.
    pub fn unfinished_transactions(&self) -> Result<Vec<i64>> {
        let mut stmt = self.connection().prepare(
            "SELECT DISTINCT t.id FROM txn t \
             LEFT JOIN txn_operation op ON op.txn_id = t.id AND op.committed = 0 \
             WHERE t.state = 'pending' \
                OR (t.state NOT IN ('rolled_back') AND op.id IS NOT NULL) \
             ORDER BY t.id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>>>()?;
        Ok(ids)
    }

    // ── Transaction Log Entries ──────────────────────────────────

    pub fn append_operation(
        &self,
        txn_id: i64,
        seq: i64,
        kind: &str,
        source_path: &str,
        target_path: Option<&str>,
        pre_hash: &str,
    ) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "INSERT INTO txn_operation \
             (txn_id, seq, kind, source_path, target_path, pre_hash, logged_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![txn_id, seq, kind, source_path, target_path, pre_hash, now],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn attach_snapshot_to_operation(&self, op_id: i64, snapshot_id: i64) -> Result<()> {
        self.connection().execute(
            "UPDATE txn_operation SET snapshot_id = ?1 WHERE id = ?2",
            params![snapshot_id, op_id],
        )?;
        Ok(())
    }

    pub fn mark_operation_committed(&self, op_id: i64) -> Result<()> {
        self.connection().execute(
            "UPDATE txn_operation SET committed = 1 WHERE id = ?1",
            params![op_id],
        )?;
        Ok(())
    }

    pub fn operations_for(&self, txn_id: i64) -> Result<Vec<OperationRow>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, txn_id, seq, kind, source_path, target_path, pre_hash, \
                    snapshot_id, logged_at, committed \
             FROM txn_operation WHERE txn_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![txn_id], |row| {
                Ok(OperationRow {
                    id: row.get(0)?,
                    txn_id: row.get(1)?,
                    seq: row.get(2)?,
                    kind: row.get(3)?,
                    source_path: row.get(4)?,
                    target_path: row.get(5)?,
                    pre_hash: row.get(6)?,
                    snapshot_id: row.get(7)?,
                    logged_at: row.get(8)?,
                    committed: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Snapshots ────────────────────────────────────────────────

    pub fn insert_snapshot(
        &self,
        kind: &str,
        content_hash: Option<&str>,
        original_path: &str,
        file_size: i64,
        mode: Option<u32>,
        mtime_ns: Option<i64>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "INSERT INTO snapshot \
             (kind, content_hash, original_path, file_size, mode, mtime_ns, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![kind, content_hash, original_path, file_size, mode, mtime_ns, now],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    pub fn get_snapshot(&self, id: i64) -> Result<Option<SnapshotRow>> {
        self.connection()
            .query_row(
                "SELECT id, kind, content_hash, original_path, file_size, mode, mtime_ns, \
                        created_at, restored_at \
                 FROM snapshot WHERE id = ?1",
                params![id],
                map_snapshot_row,
            )
            .optional()
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotRow>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, kind, content_hash, original_path, file_size, mode, mtime_ns, \
                    created_at, restored_at \
             FROM snapshot ORDER BY id DESC",
        )?;
        let rows = stmt
            .query_map([], map_snapshot_row)?
            .collect::<Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_snapshot_row(&self, id: i64) -> Result<()> {
        self.connection()
            .execute("DELETE FROM snapshot WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn mark_snapshot_restored(&self, id: i64) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.connection().execute(
            "UPDATE snapshot SET restored_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    /// True while any rollback-eligible transaction (PENDING, COMMITTED, or
    /// PARTIALLY_FAILED) references the snapshot — such a snapshot must not
    /// be deleted.
    pub fn snapshot_in_active_txn(&self, snapshot_id: i64) -> Result<bool> {
        let count: i64 = self.connection().query_row(
            "SELECT COUNT(*) FROM txn_operation op \
             JOIN txn t ON t.id = op.txn_id \
             WHERE op.snapshot_id = ?1 \
               AND t.state IN ('pending', 'committed', 'partially_failed')",
            params![snapshot_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── Snapshot Payload Refcounts ───────────────────────────────

    pub fn incr_payload_ref(&self, content_hash: &str) -> Result<i64> {
        self.connection().execute(
            "INSERT INTO snapshot_payload (content_hash, ref_count) VALUES (?1, 1) \
             ON CONFLICT(content_hash) DO UPDATE SET ref_count = ref_count + 1",
            params![content_hash],
        )?;
        self.payload_ref_count(content_hash)
    }

    /// Decrement and return the remaining count; the row is removed when it
    /// reaches zero (the caller then deletes the payload file).
    pub fn decr_payload_ref(&self, content_hash: &str) -> Result<i64> {
        self.connection().execute(
            "UPDATE snapshot_payload SET ref_count = ref_count - 1 WHERE content_hash = ?1",
            params![content_hash],
        )?;
        let remaining = self.payload_ref_count(content_hash)?;
        if remaining <= 0 {
            self.connection().execute(
                "DELETE FROM snapshot_payload WHERE content_hash = ?1",
                params![content_hash],
            )?;
        }
        Ok(remaining)
    }

    pub fn payload_ref_count(&self, content_hash: &str) -> Result<i64> {
        let count: Option<i64> = self
            .connection()
            .query_row(
                "SELECT ref_count FROM snapshot_payload WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }
}

fn map_snapshot_row(row: &rusqlite::Row<'_>) -> Result<SnapshotRow> {
    Ok(SnapshotRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        content_hash: row.get(2)?,
        original_path: row.get(3)?,
        file_size: row.get(4)?,
        mode: row.get(5)?,
        mtime_ns: row.get(6)?,
        created_at: row.get(7)?,
        restored_at: row.get(8)?,
    })
}
