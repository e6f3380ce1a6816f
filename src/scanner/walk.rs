use super::{mtime_ns_from_metadata, FileRecord};
use crate::config::ScanOptions;
use crate::error::{Error, Result};
use crate::progress::ProgressReporter;
use dashmap::DashMap;
use glob::Pattern;
use rayon::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, trace};

/// Result of one traversal invocation. Each invocation walks the roots from
/// scratch; ordering across subtrees is not guaranteed.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    /// Readable files bucketed by size (the hasher's first filter).
    pub by_size: DashMap<u64, Vec<FileRecord>>,
    /// Entries that could not be traversed: permission denied, vanished
    /// mid-walk, broken or cyclic symlinks. Never aborts the scan.
    pub errors: Vec<FileRecord>,
    pub total_files: usize,
}

/// Parallel multi-root traversal. Roots are walked by independent workers;
/// per-entry errors are captured and reported, and traversal continues.
/// Skips 0-byte files — they are trivially identical and not worth acting on.
pub fn walk(
    roots: &[String],
    options: &ScanOptions,
    cancel: &AtomicBool,
    reporter: &dyn ProgressReporter,
) -> Result<WalkOutcome> {
    let include = compile_patterns(&options.include_patterns);
    let exclude = compile_patterns(&options.exclude_patterns);

    let by_size: DashMap<u64, Vec<FileRecord>> = DashMap::new();
    let errors: Mutex<Vec<FileRecord>> = Mutex::new(Vec::new());

    roots.par_iter().try_for_each(|root| {
        walk_root(
            Path::new(root),
            options,
            &include,
            &exclude,
            cancel,
            reporter,
            &by_size,
            &errors,
        )
    })?;

    let errors = errors.into_inner().unwrap_or_default();
    let total_files = by_size.iter().map(|e| e.value().len()).sum();
    Ok(WalkOutcome {
        by_size,
        errors,
        total_files,
    })
}

fn compile_patterns(globs: &[String]) -> Vec<Pattern> {
    globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn walk_root(
    root: &Path,
    options: &ScanOptions,
    include: &[Pattern],
    exclude: &[Pattern],
    cancel: &AtomicBool,
    reporter: &dyn ProgressReporter,
    by_size: &DashMap<u64, Vec<FileRecord>>,
    errors: &Mutex<Vec<FileRecord>>,
) -> Result<()> {
    let mut walker = walkdir::WalkDir::new(root).follow_links(options.follow_symlinks);
    if let Some(depth) = options.max_depth {
        walker = walker.max_depth(depth);
    }

    let iter = walker.into_iter().filter_entry(|entry| {
        // Prune excluded directories without descending into them.
        !(entry.file_type().is_dir() && exclude.iter().any(|p| p.matches_path(entry.path())))
    });

    for entry in iter {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf());
                error!("Error traversing '{}': {}", path.display(), err);
                push_error(errors, FileRecord::with_error(path, err.to_string()));
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if exclude.iter().any(|p| p.matches_path(path)) {
            continue;
        }
        if !include.is_empty() && !include.iter().any(|p| p.matches_path(path)) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                error!("Error reading metadata for '{}': {}", path.display(), err);
                push_error(
                    errors,
                    FileRecord::with_error(path.to_path_buf(), err.to_string()),
                );
                continue;
            }
        };

        if metadata.len() == 0 {
            continue;
        }

        let record = FileRecord::new(
            path.to_path_buf(),
            metadata.len(),
            mtime_ns_from_metadata(&metadata),
        );
        trace!("Discovered '{}' ({} bytes)", path.display(), record.size);
        reporter.on_file_processed(&record);
        by_size.entry(record.size).or_default().push(record);
    }

    Ok(())
}

fn push_error(errors: &Mutex<Vec<FileRecord>>, record: FileRecord) {
    if let Ok(mut guard) = errors.lock() {
        guard.push(record);
    }
}
