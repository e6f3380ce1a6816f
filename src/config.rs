use crate::hasher::signature::HashAlgorithm;
use config::{Config, ConfigError, File as ConfigFile};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Traversal and hashing knobs for one scan invocation.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub follow_symlinks: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub max_depth: Option<usize>,
    pub hash_algorithm: HashAlgorithm,
    /// Bytes hashed for the quick signature.
    pub quick_prefix_len: usize,
    /// Read buffer for streaming full-content hashing.
    pub chunk_size: usize,
    /// Files at or above this size are hashed through a memory map.
    pub large_file_threshold: u64,
    /// Per-file hashing timeout, checked between chunks.
    pub hash_timeout: Option<Duration>,
    /// Maximum number of in-memory hash cache entries.
    pub cache_capacity: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            max_depth: None,
            hash_algorithm: HashAlgorithm::Blake3,
            quick_prefix_len: 4096,
            chunk_size: 64 * 1024,
            large_file_threshold: 16 * 1024 * 1024,
            hash_timeout: None,
            cache_capacity: 100_000,
        }
    }
}

/// Commit-side knobs for the apply/rollback orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Whole-transaction timeout; expiry between operations forces
    /// PARTIALLY_FAILED handling and automatic rollback.
    pub commit_timeout: Option<Duration>,
}

/// Snapshot retention policy enforced by `SnapshotStore::gc`.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_count: usize,
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_count: 64,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub root_paths: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

impl AppConfig {
    /// Traversal options derived from this configuration: the ignore
    /// patterns become exclude globs, everything else keeps its default.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            exclude_patterns: self.ignore_patterns.clone(),
            ..ScanOptions::default()
        }
    }
}

pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Config").required(false))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<String>) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();

    for dir in dirs {
        let dir_path = Path::new(&dir);
        let mut should_add = true;
        let result_clone = result.clone();

        for res_dir in &result_clone {
            let res_dir_path = Path::new(res_dir);

            if dir_path.starts_with(res_dir_path) {
                should_add = false;
                break;
            }

            if res_dir_path.starts_with(dir_path) {
                result.retain(|x| x != res_dir);
                break;
            }
        }

        if should_add {
            result.push(dir);
        }
    }

    result
}
