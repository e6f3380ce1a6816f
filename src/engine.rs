//! End-to-end scan pipeline: traversal, progressive hashing, grouping, and
//! persistence of the results.

use crate::config::{non_overlapping_directories, AppConfig, ScanOptions};
use crate::error::Result;
use crate::hasher::{self, HashCache};
use crate::index::DuplicateGroup;
use crate::progress::ProgressReporter;
use crate::scanner::{self, FileRecord};
use crate::storage::models::ScannedFile;
use crate::storage::Database;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ScanStats {
    pub total_files: usize,
    pub duplicate_groups: usize,
    pub duplicate_files: usize,
    pub wasted_bytes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub duration_secs: f64,
}

pub struct ScanOutcome {
    pub groups: Vec<DuplicateGroup>,
    /// Files seen but excluded: traversal or hashing failed on them.
    pub errors: Vec<FileRecord>,
    pub stats: ScanStats,
}

/// Owns one scan's cancellation token and configuration; the database holds
/// the durable side (scanned files, signatures, duplicate groups).
pub struct ScanEngine<'a> {
    db: &'a Database,
    options: ScanOptions,
    cancel: Arc<AtomicBool>,
}

impl<'a> ScanEngine<'a> {
    pub fn new(db: &'a Database, options: ScanOptions) -> Self {
        Self {
            db,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build an engine from a loaded configuration; scan the configured
    /// roots with `config.root_paths`.
    pub fn from_config(db: &'a Database, config: &AppConfig) -> Self {
        Self::new(db, config.scan_options())
    }

    /// Clone of the cancellation flag. Setting it stops the scan at the next
    /// per-file checkpoint; partial state is discarded, the database keeps
    /// its previous contents.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn scan(&self, roots: &[String], reporter: &dyn ProgressReporter) -> Result<ScanOutcome> {
        let started = Instant::now();
        reporter.on_scan_start();

        let roots = non_overlapping_directories(roots.to_vec());
        info!("Scanning {} root(s)", roots.len());

        let walked = scanner::walk(&roots, &self.options, &self.cancel, reporter)?;
        info!(
            "Traversal found {} files ({} errors)",
            walked.total_files,
            walked.errors.len()
        );

        reporter.on_hash_start();
        let hash_started = Instant::now();
        let cache = HashCache::new(self.options.cache_capacity);
        cache.load(self.db)?;

        let hashed = hasher::build_index(&walked.by_size, &self.options, &cache, &self.cancel)?;
        let groups = hashed.index.duplicate_groups(self.options.hash_algorithm);

        let duplicate_files: usize = groups.iter().map(|g| g.members.len()).sum();
        reporter.on_hash_complete(duplicate_files, hash_started.elapsed().as_secs_f64());

        self.persist(&walked.by_size, &groups, &cache)?;

        let mut errors = walked.errors;
        errors.extend(hashed.errors);

        let stats = ScanStats {
            total_files: walked.total_files,
            duplicate_groups: groups.len(),
            duplicate_files,
            wasted_bytes: groups.iter().map(|g| g.wasted_bytes()).sum(),
            cache_hits: cache.hits(),
            cache_misses: cache.misses(),
            duration_secs: started.elapsed().as_secs_f64(),
        };
        info!(
            "Scan complete: {} files, {} duplicate groups, {} bytes reclaimable ({:.2}s)",
            stats.total_files, stats.duplicate_groups, stats.wasted_bytes, stats.duration_secs
        );
        reporter.on_scan_complete(&groups, stats.duration_secs);

        Ok(ScanOutcome {
            groups,
            errors,
            stats,
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Write scan results through: scanned files, duplicate groups, and the
    /// warmed signature cache for the next run.
    fn persist(
        &self,
        by_size: &dashmap::DashMap<u64, Vec<FileRecord>>,
        groups: &[DuplicateGroup],
        cache: &HashCache,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut files: Vec<ScannedFile> = Vec::new();
        for bucket in by_size.iter() {
            for record in bucket.value() {
                let signature = cache.get(&record.path, record.size, record.mtime_ns);
                files.push(ScannedFile {
                    id: 0,
                    path: record.path.to_string_lossy().into_owned(),
                    file_size: record.size as i64,
                    mtime_ns: record.mtime_ns,
                    quick_hash: signature.as_ref().map(|s| s.quick as i64),
                    full_hash: signature.and_then(|s| s.full),
                    last_seen_at: now.clone(),
                });
            }
        }
        self.db.upsert_scanned_files(&files)?;

        let rows: Vec<(Vec<u8>, String, i64, Vec<String>)> = groups
            .iter()
            .map(|g| {
                (
                    g.full_hash.clone(),
                    g.algorithm.as_str().to_string(),
                    g.file_size as i64,
                    g.members
                        .iter()
                        .map(|m| m.path.to_string_lossy().into_owned())
                        .collect(),
                )
            })
            .collect();
        self.db.replace_duplicate_groups(&rows)?;

        cache.persist(self.db)?;
        Ok(())
    }
}
