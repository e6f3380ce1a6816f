//! Progressive two-stage content hashing.
//!
//! Stage 1 computes a quick signature (prefix + size) for every candidate;
//! stage 2 computes the full content signature only for files whose quick
//! bucket holds more than one member. Both stages consult the hash cache
//! and run on the rayon pool.

pub mod cache;
pub mod signature;

pub use cache::HashCache;
pub use signature::{HashAlgorithm, Signature};

use crate::config::ScanOptions;
use crate::error::{Error, Result};
use crate::index::ContentIndex;
use crate::scanner::FileRecord;
use dashmap::DashMap;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{error, trace};

pub struct HashOutcome {
    pub index: ContentIndex,
    /// Files that failed mid-hash (deleted, permission revoked, timeout).
    /// Excluded from grouping and reported; never retried silently.
    pub errors: Vec<FileRecord>,
}

pub fn build_index(
    by_size: &DashMap<u64, Vec<FileRecord>>,
    options: &ScanOptions,
    cache: &HashCache,
    cancel: &AtomicBool,
) -> Result<HashOutcome> {
    let index = ContentIndex::new();
    let errors: Mutex<Vec<FileRecord>> = Mutex::new(Vec::new());

    // Stage 1: quick signatures. Files with a unique size cannot have a
    // duplicate, so singleton size buckets are skipped outright.
    let size_buckets: Vec<_> = by_size
        .iter()
        .filter(|entry| entry.value().len() > 1)
        .map(|entry| entry.value().clone())
        .collect();

    size_buckets.par_iter().try_for_each(|records| {
        records.par_iter().try_for_each(|record| {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            match quick_stage(record, options, cache) {
                Ok(sig) => {
                    index.add_quick(sig.quick, record.clone());
                    Ok(())
                }
                Err(Error::Cancelled) => Err(Error::Cancelled),
                Err(e) => {
                    exclude(&errors, record, &e);
                    Ok(())
                }
            }
        })
    })?;

    // Stage 2: full signatures for ambiguous quick buckets only.
    let ambiguous = index.ambiguous_quick_buckets();
    ambiguous.par_iter().try_for_each(|(quick, records)| {
        records.par_iter().try_for_each(|record| {
            if cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            match full_stage(record, *quick, options, cache) {
                Ok(full) => {
                    trace!(
                        "Full signature for '{}' in bucket {:#x}",
                        record.path.display(),
                        quick
                    );
                    index.add_full(full, record.clone());
                    Ok(())
                }
                Err(Error::Cancelled) => Err(Error::Cancelled),
                Err(e) => {
                    exclude(&errors, record, &e);
                    Ok(())
                }
            }
        })
    })?;

    Ok(HashOutcome {
        index,
        errors: errors.into_inner().unwrap_or_default(),
    })
}

fn quick_stage(record: &FileRecord, options: &ScanOptions, cache: &HashCache) -> Result<Signature> {
    cache.get_or_compute(&record.path, record.size, record.mtime_ns, || {
        let quick =
            signature::quick_signature(&record.path, record.size, options.quick_prefix_len)
                .map_err(|source| Error::Hash {
                    path: record.path.clone(),
                    source,
                })?;
        Ok(Signature {
            quick,
            full: None,
            algorithm: options.hash_algorithm,
        })
    })
}

fn full_stage(
    record: &FileRecord,
    quick: u64,
    options: &ScanOptions,
    cache: &HashCache,
) -> Result<Vec<u8>> {
    if let Some(sig) = cache.get(&record.path, record.size, record.mtime_ns) {
        if sig.algorithm == options.hash_algorithm {
            if let Some(full) = sig.full {
                return Ok(full);
            }
        }
    }

    let full = signature::full_signature(
        &record.path,
        record.size,
        options.hash_algorithm,
        options.chunk_size,
        options.large_file_threshold,
        options.hash_timeout,
    )?;
    cache.insert(
        record.path.clone(),
        record.size,
        record.mtime_ns,
        Signature {
            quick,
            full: Some(full.clone()),
            algorithm: options.hash_algorithm,
        },
    );
    Ok(full)
}

fn exclude(errors: &Mutex<Vec<FileRecord>>, record: &FileRecord, cause: &Error) {
    error!(
        "Error hashing '{}': {} — excluded from grouping",
        record.path.display(),
        cause
    );
    let mut failed = record.clone();
    failed.error = Some(cause.to_string());
    if let Ok(mut guard) = errors.lock() {
        guard.push(failed);
    }
}
