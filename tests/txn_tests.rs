use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::tempdir;

use dupsafe::txn::snapshot::hash_file;
use dupsafe::{
    build_plan, ActionPlan, ApplyOptions, Database, DedupStrategy, Error, OpKind, Orchestrator,
    PlanOptions, ProgressReporter, RetentionPolicy, ScanEngine, ScanOptions, SilentReporter,
    SnapshotStore, TransactionLog, TxnState,
};

/// Records transaction lifecycle notifications for assertions.
#[derive(Default)]
struct RecordingReporter {
    committed: std::sync::Mutex<Vec<i64>>,
    rolled_back: std::sync::Mutex<Vec<i64>>,
}

impl ProgressReporter for RecordingReporter {
    fn on_transaction_committed(&self, transaction_id: i64) {
        self.committed.lock().unwrap().push(transaction_id);
    }

    fn on_transaction_rolled_back(&self, transaction_id: i64) {
        self.rolled_back.lock().unwrap().push(transaction_id);
    }
}

const SHARED: &str = "shared content for txn tests";

fn create_dup_pair(root: &Path) -> (PathBuf, PathBuf) {
    fs::create_dir_all(root.join("a")).unwrap();
    fs::create_dir_all(root.join("b")).unwrap();
    let keep = root.join("a/file.txt");
    let dupe = root.join("b/file.txt");
    fs::write(&keep, SHARED).unwrap();
    fs::write(&dupe, SHARED).unwrap();
    // Distinct mtimes make the canonical choice deterministic.
    filetime::set_file_mtime(&keep, filetime::FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
    filetime::set_file_mtime(&dupe, filetime::FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
    (keep, dupe)
}

fn scan_and_plan(db: &Database, root: &Path, strategy: DedupStrategy) -> ActionPlan {
    let outcome = ScanEngine::new(db, ScanOptions::default())
        .scan(&[root.to_string_lossy().into_owned()], &SilentReporter)
        .unwrap();
    build_plan(&outcome.groups, &PlanOptions { strategy }).unwrap()
}

fn orchestrator<'a>(db: &'a Database, tmp: &Path) -> Orchestrator<'a> {
    Orchestrator::new(db, tmp.join("snapshots"), ApplyOptions::default()).unwrap()
}

#[test]
fn test_apply_delete_then_rollback_restores_everything() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let (keep, dupe) = create_dup_pair(&root);
    let mtime_before = filetime::FileTime::from_last_modification_time(&fs::metadata(&dupe).unwrap());

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    assert_eq!(plan.operations.len(), 1);
    assert_eq!(plan.operations[0].source, dupe);

    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();
    assert_eq!(outcome.state, TxnState::Committed);
    assert_eq!(outcome.committed, 1);
    assert!(outcome.failure.is_none());
    assert!(keep.exists());
    assert!(!dupe.exists());

    let rollback = orch
        .rollback(outcome.transaction_id, &SilentReporter)
        .unwrap();
    assert_eq!(rollback.restored, 1);
    assert_eq!(fs::read_to_string(&dupe).unwrap(), SHARED);
    let mtime_after = filetime::FileTime::from_last_modification_time(&fs::metadata(&dupe).unwrap());
    assert_eq!(mtime_before, mtime_after);

    let row = db
        .get_transaction(outcome.transaction_id)
        .unwrap()
        .unwrap();
    assert_eq!(row.state, "rolled_back");
}

#[test]
fn test_rollback_twice_is_invalid_state() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();

    orch.rollback(outcome.transaction_id, &SilentReporter)
        .unwrap();
    let second = orch.rollback(outcome.transaction_id, &SilentReporter);
    assert!(matches!(second, Err(Error::InvalidState { .. })));
}

#[cfg(unix)]
#[test]
fn test_apply_link_replace_and_rollback() {
    use std::os::unix::fs::MetadataExt;

    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let (keep, dupe) = create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::LinkReplace);
    assert_eq!(plan.operations[0].kind, OpKind::LinkReplace);
    assert_eq!(plan.operations[0].target, Some(keep.clone()));

    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();
    assert_eq!(outcome.state, TxnState::Committed);
    assert_eq!(
        fs::metadata(&keep).unwrap().ino(),
        fs::metadata(&dupe).unwrap().ino()
    );
    assert_eq!(fs::read_to_string(&dupe).unwrap(), SHARED);

    orch.rollback(outcome.transaction_id, &SilentReporter)
        .unwrap();
    // Restored as an independent file again.
    assert_ne!(
        fs::metadata(&keep).unwrap().ino(),
        fs::metadata(&dupe).unwrap().ino()
    );
    assert_eq!(fs::read_to_string(&dupe).unwrap(), SHARED);
}

#[test]
fn test_apply_move_and_rollback() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let (_keep, dupe) = create_dup_pair(&root);
    let quarantine = tmp.path().join("quarantine");

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(
        &db,
        &root,
        DedupStrategy::Move {
            target_dir: quarantine.clone(),
        },
    );
    let target = plan.operations[0].target.clone().unwrap();

    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();
    assert_eq!(outcome.state, TxnState::Committed);
    assert!(!dupe.exists());
    assert_eq!(fs::read_to_string(&target).unwrap(), SHARED);

    orch.rollback(outcome.transaction_id, &SilentReporter)
        .unwrap();
    assert!(dupe.exists());
    assert!(!target.exists());
    assert_eq!(fs::read_to_string(&dupe).unwrap(), SHARED);
}

#[test]
fn test_reapplying_a_plan_is_a_noop() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);

    let first = orch.apply(&plan, &cancel, &SilentReporter).unwrap();
    assert_eq!(first.committed, 1);

    // Interrupted-then-retried workflows re-apply the same plan file.
    let second = orch.apply(&plan, &cancel, &SilentReporter).unwrap();
    assert_eq!(second.state, TxnState::Committed);
    assert_eq!(second.committed, 0);
    assert_eq!(second.skipped, 1);
}

#[test]
fn test_pre_image_drift_aborts_and_rolls_back() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let (_keep, dupe) = create_dup_pair(&root);

    // A second duplicate pair so the plan holds two operations.
    fs::create_dir_all(root.join("c")).unwrap();
    fs::create_dir_all(root.join("d")).unwrap();
    fs::write(root.join("c/other.bin"), vec![0x55u8; 2048]).unwrap();
    fs::write(root.join("d/other.bin"), vec![0x55u8; 2048]).unwrap();

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    assert_eq!(plan.operations.len(), 2);

    // The file changed between planning and applying.
    let drifted = "DRIFTED content for txn tests";
    fs::write(&dupe, drifted).unwrap();

    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();

    assert_eq!(outcome.state, TxnState::RolledBack);
    assert!(outcome.failure.is_some());
    // Everything is back: the drifted file untouched, any executed delete
    // restored from its snapshot.
    assert_eq!(fs::read_to_string(&dupe).unwrap(), drifted);
    assert!(root.join("d/other.bin").exists() || root.join("c/other.bin").exists());
    assert_eq!(
        fs::read(root.join("c/other.bin")).unwrap(),
        vec![0x55u8; 2048]
    );
    assert_eq!(
        fs::read(root.join("d/other.bin")).unwrap(),
        vec![0x55u8; 2048]
    );
}

#[test]
fn test_cancel_during_apply_rolls_back() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let (_keep, dupe) = create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    let orch = orchestrator(&db, tmp.path());

    let cancel = AtomicBool::new(false);
    cancel.store(true, Ordering::Relaxed);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();

    assert_eq!(outcome.state, TxnState::RolledBack);
    assert_eq!(outcome.committed, 0);
    assert!(dupe.exists());
}

#[test]
fn test_recover_rolls_back_crashed_transaction() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let (_keep, dupe) = create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    let op = &plan.operations[0];

    // Simulate a crash after the mutation but before the committed marker:
    // log entry present, snapshot taken, file deleted, nothing marked.
    let log = TransactionLog::new(&db);
    let snapshots = SnapshotStore::new(&db, tmp.path().join("snapshots"));
    let txn_id = log.begin().unwrap();
    let entry_id = log.append(txn_id, 0, op).unwrap();
    let snapshot = snapshots.create(&dupe, OpKind::Delete).unwrap();
    log.attach_snapshot(entry_id, snapshot.id).unwrap();
    fs::remove_file(&dupe).unwrap();

    // The pending transaction pins its snapshot until recovery resolves it.
    assert!(matches!(
        snapshots.delete(snapshot.id),
        Err(Error::SnapshotInUse { .. })
    ));

    let orch = orchestrator(&db, tmp.path());
    let outcomes = orch.recover(&SilentReporter).unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].transaction_id, txn_id);
    assert_eq!(outcomes[0].restored, 1);

    assert_eq!(fs::read_to_string(&dupe).unwrap(), SHARED);
    assert_eq!(
        db.get_transaction(txn_id).unwrap().unwrap().state,
        "rolled_back"
    );
    // A second recovery pass finds nothing to do.
    assert!(orch.recover(&SilentReporter).unwrap().is_empty());
}

#[test]
fn test_snapshot_round_trip_shares_payloads() {
    let tmp = tempdir().unwrap();
    let file_a = tmp.path().join("a.txt");
    let file_b = tmp.path().join("b.txt");
    fs::write(&file_a, "identical payload bytes").unwrap();
    fs::write(&file_b, "identical payload bytes").unwrap();

    let db = Database::open_in_memory().unwrap();
    let store = SnapshotStore::new(&db, tmp.path().join("snapshots"));

    let snap_a = store.create(&file_a, OpKind::Delete).unwrap();
    let snap_b = store.create(&file_b, OpKind::Delete).unwrap();
    let hash = snap_a.content_hash.clone().unwrap();
    assert_eq!(snap_b.content_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(db.payload_ref_count(&hash).unwrap(), 2);

    fs::remove_file(&file_a).unwrap();
    store.restore(snap_a.id).unwrap();
    assert_eq!(fs::read_to_string(&file_a).unwrap(), "identical payload bytes");

    // Restoring when the content already matches is a no-op success.
    store.restore(snap_a.id).unwrap();

    // The shared payload survives until the last referencing snapshot goes.
    store.delete(snap_a.id).unwrap();
    assert_eq!(db.payload_ref_count(&hash).unwrap(), 1);
    store.delete(snap_b.id).unwrap();
    assert_eq!(db.payload_ref_count(&hash).unwrap(), 0);
}

#[test]
fn test_restore_rejects_corrupt_payload() {
    let tmp = tempdir().unwrap();
    let file = tmp.path().join("precious.txt");
    fs::write(&file, "precious bytes").unwrap();

    let db = Database::open_in_memory().unwrap();
    let snapshot_root = tmp.path().join("snapshots");
    let store = SnapshotStore::new(&db, snapshot_root.clone());
    let snap = store.create(&file, OpKind::Delete).unwrap();
    let hash = snap.content_hash.clone().unwrap();

    // Flip the stored payload's bytes behind the store's back.
    let payload = snapshot_root.join("objects").join(&hash[..2]).join(&hash);
    assert_eq!(hash_file(&payload).unwrap(), hash);
    fs::write(&payload, "tampered").unwrap();

    fs::remove_file(&file).unwrap();
    let result = store.restore(snap.id);
    assert!(matches!(result, Err(Error::Integrity { .. })));
    assert!(!file.exists());
}

#[test]
fn test_snapshot_gc_honors_retention_and_references() {
    let tmp = tempdir().unwrap();
    let pinned_file = tmp.path().join("pinned.txt");
    let loose_file = tmp.path().join("loose.txt");
    fs::write(&pinned_file, "pinned content").unwrap();
    fs::write(&loose_file, "loose content").unwrap();

    let db = Database::open_in_memory().unwrap();
    let store = SnapshotStore::new(&db, tmp.path().join("snapshots"));

    let pinned = store.create(&pinned_file, OpKind::Delete).unwrap();
    let loose = store.create(&loose_file, OpKind::Delete).unwrap();

    // Pin the first snapshot through a committed transaction.
    let txn_id = db.create_transaction("pending").unwrap();
    let op = db
        .append_operation(txn_id, 0, "delete", "/pinned.txt", None, "h")
        .unwrap();
    db.attach_snapshot_to_operation(op, pinned.id).unwrap();
    db.mark_operation_committed(op).unwrap();
    db.set_transaction_state(txn_id, "committed", true).unwrap();

    assert!(matches!(
        store.delete(pinned.id),
        Err(Error::SnapshotInUse { .. })
    ));

    let policy = RetentionPolicy {
        max_count: 0,
        max_age: std::time::Duration::from_secs(0),
    };
    let removed = store.gc(&policy).unwrap();
    assert_eq!(removed, 1);
    assert!(db.get_snapshot(loose.id).unwrap().is_none());
    assert!(db.get_snapshot(pinned.id).unwrap().is_some());
}

#[test]
fn test_delete_snapshot_of_rolled_back_transaction() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let (_keep, dupe) = create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();
    orch.rollback(outcome.transaction_id, &SilentReporter)
        .unwrap();

    let snapshot_id = db
        .operations_for(outcome.transaction_id)
        .unwrap()[0]
        .snapshot_id
        .unwrap();
    let snapshot = db.get_snapshot(snapshot_id).unwrap().unwrap();
    let hash = snapshot.content_hash.clone().unwrap();
    let payload = tmp
        .path()
        .join("snapshots/objects")
        .join(&hash[..2])
        .join(&hash);
    assert!(payload.exists());

    // A rolled-back transaction no longer pins its snapshot; deleting it
    // must clean up the row, the log-entry reference, and the payload —
    // in that order, so nothing restorable is lost on a partial failure.
    let store = SnapshotStore::new(&db, tmp.path().join("snapshots"));
    store.delete(snapshot_id).unwrap();

    assert!(db.get_snapshot(snapshot_id).unwrap().is_none());
    assert!(!payload.exists());
    assert_eq!(db.payload_ref_count(&hash).unwrap(), 0);
    let entry = &db.operations_for(outcome.transaction_id).unwrap()[0];
    assert!(entry.snapshot_id.is_none());
    assert_eq!(fs::read_to_string(&dupe).unwrap(), SHARED);
}

#[test]
fn test_rollback_notifies_reporter() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);

    let reporter = RecordingReporter::default();
    let outcome = orch.apply(&plan, &cancel, &reporter).unwrap();
    assert_eq!(
        reporter.committed.lock().unwrap().as_slice(),
        &[outcome.transaction_id]
    );

    orch.rollback(outcome.transaction_id, &reporter).unwrap();
    assert_eq!(
        reporter.rolled_back.lock().unwrap().as_slice(),
        &[outcome.transaction_id]
    );
}

#[test]
fn test_commit_timeout_forces_rollback() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let (_keep, dupe) = create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    let orch = Orchestrator::new(
        &db,
        tmp.path().join("snapshots"),
        ApplyOptions {
            commit_timeout: Some(std::time::Duration::ZERO),
        },
    )
    .unwrap();

    let cancel = AtomicBool::new(false);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();

    assert_eq!(outcome.state, TxnState::RolledBack);
    assert_eq!(outcome.committed, 0);
    assert!(outcome.failure.unwrap().contains("Timeout"));
    assert!(dupe.exists());
}

#[test]
fn test_partial_rollback_reports_restored_subset() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    create_dup_pair(&root);

    let db = Database::open_in_memory().unwrap();
    let plan = scan_and_plan(&db, &root, DedupStrategy::Delete);
    let orch = orchestrator(&db, tmp.path());
    let cancel = AtomicBool::new(false);
    let outcome = orch.apply(&plan, &cancel, &SilentReporter).unwrap();

    // Sabotage the stored payload so the restore cannot succeed.
    let snapshot_id = db
        .operations_for(outcome.transaction_id)
        .unwrap()[0]
        .snapshot_id
        .unwrap();
    let hash = db
        .get_snapshot(snapshot_id)
        .unwrap()
        .unwrap()
        .content_hash
        .unwrap();
    let payload = tmp
        .path()
        .join("snapshots/objects")
        .join(&hash[..2])
        .join(&hash);
    fs::write(&payload, "tampered").unwrap();

    let result = orch.rollback(outcome.transaction_id, &SilentReporter);
    assert!(matches!(
        result,
        Err(Error::RollbackIncomplete { restored: 0, .. })
    ));
    // Still eligible for another attempt, never claimed as fully undone.
    assert_eq!(
        db.get_transaction(outcome.transaction_id)
            .unwrap()
            .unwrap()
            .state,
        "partially_failed"
    );
}
