use crate::hasher::signature::{hex_encode, HashAlgorithm};
use crate::scanner::FileRecord;
use dashmap::DashMap;
use std::path::Path;

/// Files sharing one full content signature. Cardinality is always ≥ 2.
#[derive(Debug, Clone)]
pub struct DuplicateGroup {
    pub full_hash: Vec<u8>,
    pub algorithm: HashAlgorithm,
    pub file_size: u64,
    pub members: Vec<FileRecord>,
}

impl DuplicateGroup {
    pub fn full_hash_hex(&self) -> String {
        hex_encode(&self.full_hash)
    }

    pub fn wasted_bytes(&self) -> u64 {
        self.file_size * (self.members.len() as u64 - 1)
    }
}

/// Groups file records by signature into duplicate candidates.
///
/// dashmap shards the buckets, so writes to unrelated signatures never
/// contend while reads proceed concurrently. Supports incremental add and
/// remove without a rebuild.
#[derive(Debug, Default)]
pub struct ContentIndex {
    quick: DashMap<u64, Vec<FileRecord>>,
    full: DashMap<Vec<u8>, Vec<FileRecord>>,
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_quick(&self, quick: u64, record: FileRecord) {
        self.quick.entry(quick).or_default().push(record);
    }

    pub fn add_full(&self, full: Vec<u8>, record: FileRecord) {
        self.full.entry(full).or_default().push(record);
    }

    /// Quick buckets holding more than one candidate; only these are worth
    /// a full-content hash.
    pub fn ambiguous_quick_buckets(&self) -> Vec<(u64, Vec<FileRecord>)> {
        self.quick
            .iter()
            .filter(|entry| entry.value().len() > 1)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Drop one path from both maps; empties are pruned so group counts
    /// stay accurate after incremental removals.
    pub fn remove(&self, path: &Path) {
        self.quick.retain(|_, records| {
            records.retain(|r| r.path != path);
            !records.is_empty()
        });
        self.full.retain(|_, records| {
            records.retain(|r| r.path != path);
            !records.is_empty()
        });
    }

    pub fn quick_bucket_count(&self) -> usize {
        self.quick.len()
    }

    /// Finalized duplicate groups: full-signature buckets with ≥ 2 members.
    pub fn duplicate_groups(&self, algorithm: HashAlgorithm) -> Vec<DuplicateGroup> {
        let mut groups: Vec<DuplicateGroup> = self
            .full
            .iter()
            .filter(|entry| entry.value().len() > 1)
            .map(|entry| DuplicateGroup {
                full_hash: entry.key().clone(),
                algorithm,
                file_size: entry.value()[0].size,
                members: entry.value().clone(),
            })
            .collect();
        // Deterministic output order regardless of shard iteration.
        groups.sort_by(|a, b| a.full_hash.cmp(&b.full_hash));
        groups
    }
}
