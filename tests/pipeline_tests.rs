use std::fs;
use std::path::Path;
use tempfile::tempdir;

use dupsafe::{
    build_plan, ActionPlan, Database, DedupStrategy, OpKind, PlanOptions, ScanEngine, ScanOptions,
    SilentReporter,
};

/// Create a temp directory tree with known duplicates.
/// Layout:
///   root/
///     folder_a/
///       unique_a.txt     ("unique content a")
///       shared.txt       ("shared content xyz")
///     folder_b/
///       unique_b.txt     ("unique content b")
///       shared.txt       ("shared content xyz")  ← duplicate of folder_a/shared.txt
///     folder_c/
///       large_dup_1.bin  (4KB of 0xAA)
///       large_dup_2.bin  (4KB of 0xAA)            ← duplicate within same folder
fn create_test_tree(root: &Path) {
    let folder_a = root.join("folder_a");
    let folder_b = root.join("folder_b");
    let folder_c = root.join("folder_c");
    fs::create_dir_all(&folder_a).unwrap();
    fs::create_dir_all(&folder_b).unwrap();
    fs::create_dir_all(&folder_c).unwrap();

    fs::write(folder_a.join("unique_a.txt"), "unique content a").unwrap();
    fs::write(folder_b.join("unique_b.txt"), "unique content b").unwrap();

    fs::write(folder_a.join("shared.txt"), "shared content xyz").unwrap();
    fs::write(folder_b.join("shared.txt"), "shared content xyz").unwrap();

    let large_content = vec![0xAAu8; 4096];
    fs::write(folder_c.join("large_dup_1.bin"), &large_content).unwrap();
    fs::write(folder_c.join("large_dup_2.bin"), &large_content).unwrap();
}

fn roots_for(root: &Path) -> Vec<String> {
    vec![root.to_string_lossy().into_owned()]
}

#[test]
fn test_full_scan_pipeline() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("scan_root");
    create_test_tree(&root);

    let db = Database::open_in_memory().unwrap();
    let engine = ScanEngine::new(&db, ScanOptions::default());
    let outcome = engine.scan(&roots_for(&root), &SilentReporter).unwrap();

    assert_eq!(outcome.stats.total_files, 6);
    // Two groups: shared.txt pair and the large binary pair.
    assert_eq!(outcome.groups.len(), 2);
    for group in &outcome.groups {
        assert_eq!(group.members.len(), 2);
    }
    assert_eq!(outcome.stats.duplicate_files, 4);
    assert_eq!(outcome.stats.wasted_bytes, 18 + 4096);
    assert!(outcome.errors.is_empty());
}

#[test]
fn test_scan_persists_groups_to_database() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("scan_root");
    create_test_tree(&root);

    let db = Database::open_in_memory().unwrap();
    ScanEngine::new(&db, ScanOptions::default())
        .scan(&roots_for(&root), &SilentReporter)
        .unwrap();

    let groups = db.get_duplicate_groups(0, 100).unwrap();
    assert_eq!(groups.len(), 2);
    // Largest wasted first.
    assert!(groups[0].wasted_bytes >= groups[1].wasted_bytes);

    let members = db.get_files_in_group(groups[0].id).unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(
        db.get_total_wasted_bytes().unwrap(),
        18 + 4096
    );
}

#[test]
fn test_rescan_uses_persisted_signatures() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("scan_root");
    create_test_tree(&root);

    let db_dir = tempdir().unwrap();
    let db_path = db_dir.path().join("dupsafe.db");

    {
        let db = Database::open(db_path.to_str().unwrap()).unwrap();
        let first = ScanEngine::new(&db, ScanOptions::default())
            .scan(&roots_for(&root), &SilentReporter)
            .unwrap();
        assert!(first.stats.cache_misses > 0);
    }

    // Fresh process, same database: nothing changed on disk, so hashing is
    // fully served from the persisted signature table.
    let db = Database::open(db_path.to_str().unwrap()).unwrap();
    let second = ScanEngine::new(&db, ScanOptions::default())
        .scan(&roots_for(&root), &SilentReporter)
        .unwrap();
    assert_eq!(second.stats.cache_misses, 0);
    assert_eq!(second.groups.len(), 2);
}

#[test]
fn test_modified_file_leaves_its_group() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("scan_root");
    create_test_tree(&root);

    let db = Database::open_in_memory().unwrap();
    let first = ScanEngine::new(&db, ScanOptions::default())
        .scan(&roots_for(&root), &SilentReporter)
        .unwrap();
    assert_eq!(first.groups.len(), 2);

    // Diverge one member of the shared.txt pair; same length, new content
    // and mtime, so the stale cache entry must not be trusted.
    fs::write(root.join("folder_b/shared.txt"), "shared content XYZ").unwrap();

    let second = ScanEngine::new(&db, ScanOptions::default())
        .scan(&roots_for(&root), &SilentReporter)
        .unwrap();
    assert_eq!(second.groups.len(), 1);
    assert!(second.groups[0]
        .members
        .iter()
        .all(|m| m.path.ends_with("large_dup_1.bin") || m.path.ends_with("large_dup_2.bin")));
}

#[test]
fn test_scan_to_plan_delete_strategy() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("scan_root");
    create_test_tree(&root);

    let db = Database::open_in_memory().unwrap();
    let outcome = ScanEngine::new(&db, ScanOptions::default())
        .scan(&roots_for(&root), &SilentReporter)
        .unwrap();

    let plan = build_plan(&outcome.groups, &PlanOptions::default()).unwrap();
    // One non-canonical member per group.
    assert_eq!(plan.operations.len(), 2);
    assert!(plan.operations.iter().all(|op| op.kind == OpKind::Delete));
    assert!(plan.transaction_id.is_none());

    // Planning never touches the filesystem.
    assert!(root.join("folder_a/shared.txt").exists());
    assert!(root.join("folder_b/shared.txt").exists());
}

#[test]
fn test_plan_round_trips_through_file() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("scan_root");
    create_test_tree(&root);

    let db = Database::open_in_memory().unwrap();
    let outcome = ScanEngine::new(&db, ScanOptions::default())
        .scan(&roots_for(&root), &SilentReporter)
        .unwrap();

    let plan = build_plan(
        &outcome.groups,
        &PlanOptions {
            strategy: DedupStrategy::Move {
                target_dir: tmp.path().join("quarantine"),
            },
        },
    )
    .unwrap();

    let plan_path = tmp.path().join("plan.json");
    plan.save(&plan_path).unwrap();
    let loaded = ActionPlan::load(&plan_path).unwrap();

    assert_eq!(loaded.operations.len(), plan.operations.len());
    assert_eq!(loaded.algorithm, plan.algorithm);
    for (a, b) in loaded.operations.iter().zip(plan.operations.iter()) {
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.source, b.source);
        assert_eq!(a.target, b.target);
        assert_eq!(a.expected_hash, b.expected_hash);
    }
}

#[test]
fn test_unreadable_entry_does_not_abort_scan() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("scan_root");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("a.txt"), "fine content").unwrap();
    fs::write(root.join("b.txt"), "fine content").unwrap();
    fs::write(root.join("dangling"), "x").unwrap();
    fs::remove_file(root.join("dangling")).unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink(root.join("dangling"), root.join("broken_link")).unwrap();

    let db = Database::open_in_memory().unwrap();
    let options = ScanOptions {
        follow_symlinks: true,
        ..Default::default()
    };
    let outcome = ScanEngine::new(&db, options)
        .scan(&roots_for(&root), &SilentReporter)
        .unwrap();

    assert_eq!(outcome.groups.len(), 1);
    #[cfg(unix)]
    assert!(!outcome.errors.is_empty());
}
