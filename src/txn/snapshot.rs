use crate::config::RetentionPolicy;
use crate::error::{Error, Result};
use crate::planner::OpKind;
use crate::scanner::mtime_ns_from_metadata;
use crate::storage::models::SnapshotRow;
use crate::storage::Database;
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Captures reversible pre-mutation state, content-addressed.
///
/// Payloads live under `<root>/objects/<2-hex fanout>/<blake3 hex>`; two
/// snapshots of byte-identical content share one payload, tracked by a
/// refcount. Metadata (original path, permissions, mtime) lives in the
/// `snapshot` table. Move snapshots record only the original path — a move
/// is reversible by re-moving.
pub struct SnapshotStore<'a> {
    db: &'a Database,
    root: PathBuf,
}

impl<'a> SnapshotStore<'a> {
    pub fn new(db: &'a Database, root: PathBuf) -> Self {
        Self { db, root }
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn payload_path(&self, hash_hex: &str) -> PathBuf {
        let fanout = &hash_hex[..2.min(hash_hex.len())];
        self.objects_dir().join(fanout).join(hash_hex)
    }

    /// Capture the state needed to reverse one operation on `path`.
    /// Must be durable before the operation's mutation runs.
    pub fn create(&self, path: &Path, kind: OpKind) -> Result<SnapshotRow> {
        let metadata = fs::metadata(path)?;
        let mode = permission_mode(&metadata);
        let mtime_ns = mtime_ns_from_metadata(&metadata);
        let path_str = path.to_string_lossy();

        let content_hash = match kind {
            // Reversible by re-moving; no copy required.
            OpKind::Move => None,
            OpKind::Delete | OpKind::LinkReplace => Some(self.store_payload(path)?),
        };

        let id = self.db.insert_snapshot(
            kind.as_str(),
            content_hash.as_deref(),
            &path_str,
            metadata.len() as i64,
            mode,
            Some(mtime_ns),
        )?;
        debug!(
            "Snapshot {} created for '{}' ({:?})",
            id,
            path.display(),
            content_hash
        );
        self.db
            .get_snapshot(id)?
            .ok_or(Error::SnapshotMissing { id })
    }

    /// Stream `path` into the content-addressed store. Hash and copy happen
    /// in one pass; the payload lands via tmp-write + fsync + rename so a
    /// crash never leaves a half-written object under its final name.
    fn store_payload(&self, path: &Path) -> Result<String> {
        fs::create_dir_all(self.tmp_dir())?;

        let tmp_path = self.tmp_dir().join(format!(
            "{}-{}.tmp",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));

        let mut src = File::open(path)?;
        let mut tmp = File::create(&tmp_path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = src.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            tmp.write_all(&buffer[..n])?;
        }
        tmp.sync_all()?;
        drop(tmp);

        let hash_hex = hasher.finalize().to_hex().to_string();
        let final_path = self.payload_path(&hash_hex);
        if final_path.exists() {
            // Identical bytes already stored; share the payload.
            fs::remove_file(&tmp_path)?;
        } else {
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&tmp_path, &final_path)?;
        }
        self.db.incr_payload_ref(&hash_hex)?;
        Ok(hash_hex)
    }

    /// Restore the snapshotted bytes and metadata to the original path.
    ///
    /// Verified and idempotent: if the current content already matches the
    /// snapshot, this is a no-op success. A payload whose bytes no longer
    /// match their address is an integrity failure, surfaced, never
    /// silently treated as success.
    pub fn restore(&self, id: i64) -> Result<()> {
        let row = self
            .db
            .get_snapshot(id)?
            .ok_or(Error::SnapshotMissing { id })?;

        let Some(hash_hex) = row.content_hash.clone() else {
            // Move snapshots carry no payload; reversal is the
            // orchestrator's re-move.
            return Ok(());
        };

        let target = PathBuf::from(&row.original_path);
        if target.exists() && hash_file(&target)? == hash_hex {
            debug!("Snapshot {} already restored at '{}'", id, target.display());
            self.db.mark_snapshot_restored(id)?;
            return Ok(());
        }

        let payload = self.payload_path(&hash_hex);
        if !payload.exists() {
            return Err(Error::SnapshotMissing { id });
        }
        let actual = hash_file(&payload)?;
        if actual != hash_hex {
            return Err(Error::Integrity {
                path: payload,
                expected: hash_hex,
                actual,
            });
        }

        // Write next to the target and rename into place; also breaks any
        // hardlink the target participates in without touching the other
        // link.
        let tmp = restore_tmp_path(&target);
        fs::copy(&payload, &tmp)?;
        let f = File::open(&tmp)?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, &target)?;

        apply_permission_mode(&target, row.mode)?;
        if let Some(mtime_ns) = row.mtime_ns {
            let mtime = FileTime::from_unix_time(
                mtime_ns.div_euclid(1_000_000_000),
                mtime_ns.rem_euclid(1_000_000_000) as u32,
            );
            filetime::set_file_mtime(&target, mtime)?;
        }

        self.db.mark_snapshot_restored(id)?;
        info!("Snapshot {} restored to '{}'", id, target.display());
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<SnapshotRow> {
        self.db
            .get_snapshot(id)?
            .ok_or(Error::SnapshotMissing { id })
    }

    pub fn list(&self) -> Result<Vec<SnapshotRow>> {
        Ok(self.db.list_snapshots()?)
    }

    /// Delete one snapshot. Rejected while a rollback-eligible transaction
    /// (PENDING, COMMITTED, or PARTIALLY_FAILED) still references it. The
    /// payload file is removed only when its refcount reaches zero.
    pub fn delete(&self, id: i64) -> Result<()> {
        let row = self
            .db
            .get_snapshot(id)?
            .ok_or(Error::SnapshotMissing { id })?;
        if self.db.snapshot_in_active_txn(id)? {
            return Err(Error::SnapshotInUse { id });
        }

        // Metadata first: the row delete detaches any log entries still
        // pointing here (rolled-back transactions keep their entries). The
        // payload unlink comes last, after every database step succeeded, so
        // a failure part-way through never destroys restorable bytes.
        self.db.delete_snapshot_row(id)?;
        if let Some(hash_hex) = &row.content_hash {
            let remaining = self.db.decr_payload_ref(hash_hex)?;
            if remaining <= 0 {
                let payload = self.payload_path(hash_hex);
                if payload.exists() {
                    fs::remove_file(&payload)?;
                }
            }
        }
        debug!("Snapshot {} deleted", id);
        Ok(())
    }

    /// Reclaim snapshots outside the retention policy. Snapshots still
    /// referenced by rollback-eligible transactions are skipped.
    pub fn gc(&self, policy: &RetentionPolicy) -> Result<usize> {
        let now = chrono::Utc::now();
        let rows = self.list()?; // newest first
        let mut removed = 0;

        for (index, row) in rows.iter().enumerate() {
            let too_many = index >= policy.max_count;
            let too_old = chrono::DateTime::parse_from_rfc3339(&row.created_at)
                .map(|created| {
                    now.signed_duration_since(created).to_std().unwrap_or_default()
                        > policy.max_age
                })
                .unwrap_or(false);
            if !(too_many || too_old) {
                continue;
            }
            match self.delete(row.id) {
                Ok(()) => removed += 1,
                Err(Error::SnapshotInUse { id }) => {
                    debug!("Snapshot {} outside retention but still referenced", id);
                }
                Err(e) => {
                    warn!("Failed to gc snapshot {}: {}", row.id, e);
                }
            }
        }
        if removed > 0 {
            info!("Snapshot gc removed {} snapshots", removed);
        }
        Ok(removed)
    }
}

/// Blake3 over a whole file, streamed. Snapshot addressing always uses
/// blake3 regardless of the scan's configured algorithm.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn restore_tmp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "restore".to_string());
    target.with_file_name(format!(".{}.restore-tmp", name))
}

#[cfg(unix)]
fn permission_mode(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn permission_mode(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
fn apply_permission_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_permission_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
