use super::signature::{HashAlgorithm, Signature};
use crate::error::Result;
use crate::storage::models::SignatureRow;
use crate::storage::Database;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

struct CacheEntry {
    size: u64,
    mtime_ns: i64,
    signature: Signature,
    last_used: u64,
}

/// Memoizes signatures keyed by path, validated against (size, mtime).
///
/// A lookup whose size or mtime no longer matches the stored entry is a
/// stale miss and the entry is replaced. Safe for concurrent hashing
/// workers: racing misses on one key may each compute and the last write
/// wins — final state is always a signature of the current content.
/// Bounded by `capacity` with least-recently-used eviction.
pub struct HashCache {
    entries: DashMap<PathBuf, CacheEntry>,
    capacity: usize,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HashCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the cached signature if the key still matches; no file I/O on
    /// a hit.
    pub fn get(&self, path: &Path, size: u64, mtime_ns: i64) -> Option<Signature> {
        let mut entry = self.entries.get_mut(path)?;
        if entry.size != size || entry.mtime_ns != mtime_ns {
            return None;
        }
        entry.last_used = self.tick();
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.signature.clone())
    }

    /// Cache-or-compute: on a key match the cached signature is returned
    /// without invoking `compute`; on a miss or stale key, `compute` runs
    /// and its result replaces any stale entry.
    pub fn get_or_compute<F>(
        &self,
        path: &Path,
        size: u64,
        mtime_ns: i64,
        compute: F,
    ) -> Result<Signature>
    where
        F: FnOnce() -> Result<Signature>,
    {
        if let Some(signature) = self.get(path, size, mtime_ns) {
            trace!("Cache hit for '{}'", path.display());
            return Ok(signature);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let signature = compute()?;
        self.insert(path.to_path_buf(), size, mtime_ns, signature.clone());
        Ok(signature)
    }

    pub fn insert(&self, path: PathBuf, size: u64, mtime_ns: i64, signature: Signature) {
        let last_used = self.tick();
        self.entries.insert(
            path,
            CacheEntry {
                size,
                mtime_ns,
                signature,
                last_used,
            },
        );
        self.evict_if_needed();
    }

    fn evict_if_needed(&self) {
        let over = self.entries.len().saturating_sub(self.capacity);
        if over == 0 {
            return;
        }
        let mut by_age: Vec<(PathBuf, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().last_used))
            .collect();
        by_age.sort_by_key(|(_, used)| *used);
        for (path, _) in by_age.into_iter().take(over) {
            self.entries.remove(&path);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Warm the cache from the `file_signature` table, so unchanged files
    /// are served across runs with zero content reads.
    pub fn load(&self, db: &Database) -> Result<usize> {
        let rows = db.load_signatures()?;
        let count = rows.len();
        for row in rows {
            let algorithm = HashAlgorithm::from_name(&row.algorithm)
                .unwrap_or(HashAlgorithm::Blake3);
            self.insert(
                PathBuf::from(&row.path),
                row.file_size as u64,
                row.mtime_ns,
                Signature {
                    quick: row.quick_hash as u64,
                    full: row.full_hash,
                    algorithm,
                },
            );
        }
        debug!("Loaded {} cached signatures", count);
        Ok(count)
    }

    /// Write the current entries back to the `file_signature` table.
    pub fn persist(&self, db: &Database) -> Result<usize> {
        let now = chrono::Utc::now().to_rfc3339();
        let rows: Vec<SignatureRow> = self
            .entries
            .iter()
            .map(|entry| SignatureRow {
                path: entry.key().to_string_lossy().into_owned(),
                file_size: entry.value().size as i64,
                mtime_ns: entry.value().mtime_ns,
                algorithm: entry.value().signature.algorithm.as_str().to_string(),
                quick_hash: entry.value().signature.quick as i64,
                full_hash: entry.value().signature.full.clone(),
                updated_at: now.clone(),
            })
            .collect();
        let count = db.upsert_signatures(&rows)?;
        debug!("Persisted {} cached signatures", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(quick: u64) -> Signature {
        Signature {
            quick,
            full: None,
            algorithm: HashAlgorithm::Blake3,
        }
    }

    #[test]
    fn test_hit_skips_compute() {
        let cache = HashCache::new(16);
        let path = Path::new("/x/a");
        cache.insert(path.to_path_buf(), 10, 111, sig(42));

        let got = cache
            .get_or_compute(path, 10, 111, || panic!("compute must not run on a hit"))
            .unwrap();
        assert_eq!(got.quick, 42);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_stale_key_recomputes() {
        let cache = HashCache::new(16);
        let path = Path::new("/x/a");
        cache.insert(path.to_path_buf(), 10, 111, sig(42));

        // mtime changed: stale, compute runs, entry replaced
        let got = cache.get_or_compute(path, 10, 999, || Ok(sig(7))).unwrap();
        assert_eq!(got.quick, 7);
        assert_eq!(cache.get(path, 10, 999).unwrap().quick, 7);
        assert!(cache.get(path, 10, 111).is_none());
    }

    #[test]
    fn test_lru_eviction_bounds_size() {
        let cache = HashCache::new(4);
        for i in 0..10u64 {
            cache.insert(PathBuf::from(format!("/f/{}", i)), i, 0, sig(i));
        }
        assert!(cache.len() <= 4);
        // Most recently inserted survives.
        assert!(cache.get(Path::new("/f/9"), 9, 0).is_some());
    }
}
