use crate::error::{Error, Result};
use crate::hasher::signature::HashAlgorithm;
use crate::index::DuplicateGroup;
use crate::scanner::FileRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    Delete,
    Move,
    LinkReplace,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Delete => "delete",
            OpKind::Move => "move",
            OpKind::LinkReplace => "link-replace",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "delete" => Some(OpKind::Delete),
            "move" => Some(OpKind::Move),
            "link-replace" => Some(OpKind::LinkReplace),
            _ => None,
        }
    }
}

/// One intended filesystem mutation. `expected_hash` is the pre-image the
/// orchestrator verifies before touching `source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    pub expected_hash: String,
}

/// Ordered, dry-run-computable list of operations. Pure data: building and
/// serializing a plan never mutates the filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlan {
    /// Filled in by `apply`; absent for a dry-run plan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    pub algorithm: HashAlgorithm,
    pub operations: Vec<Operation>,
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Re-run the path-conflict rules on an already-built plan. Plans loaded
    /// from disk may have been hand-edited, so applying one re-validates.
    pub fn validate(&self) -> Result<()> {
        check_conflicts(&self.operations)
    }
}

/// How non-canonical members are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupStrategy {
    /// Remove each duplicate.
    Delete,
    /// Replace each duplicate with a hardlink to the canonical file.
    LinkReplace,
    /// Quarantine duplicates under a directory instead of deleting.
    Move { target_dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub strategy: DedupStrategy,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::Delete,
        }
    }
}

/// Pick the canonical member of a group.
///
/// Policy (deterministic, applied in priority order until unique): earliest
/// mtime, fewest path components, shortest path, lexicographically smallest
/// path bytes.
pub fn canonical_index(members: &[FileRecord]) -> usize {
    let mut best = 0;
    for (i, candidate) in members.iter().enumerate().skip(1) {
        let current = &members[best];
        let candidate_key = (
            candidate.mtime_ns,
            candidate.path.components().count(),
            candidate.path.as_os_str().len(),
            candidate.path.as_os_str().to_os_string(),
        );
        let current_key = (
            current.mtime_ns,
            current.path.components().count(),
            current.path.as_os_str().len(),
            current.path.as_os_str().to_os_string(),
        );
        if candidate_key < current_key {
            best = i;
        }
    }
    best
}

/// Turn finalized duplicate groups into an ordered action plan.
///
/// Fails with `PlanConflict` before emitting anything if the plan would
/// touch a path twice or route a move target over another operation's path.
pub fn build_plan(groups: &[DuplicateGroup], options: &PlanOptions) -> Result<ActionPlan> {
    let algorithm = groups
        .first()
        .map(|g| g.algorithm)
        .unwrap_or(HashAlgorithm::Blake3);
    let mut operations = Vec::new();

    for group in groups {
        let hash_hex = group.full_hash_hex();
        let canonical = canonical_index(&group.members);
        let canonical_path = group.members[canonical].path.clone();

        for (i, member) in group.members.iter().enumerate() {
            if i == canonical {
                continue;
            }
            let operation = match &options.strategy {
                DedupStrategy::Delete => Operation {
                    kind: OpKind::Delete,
                    source: member.path.clone(),
                    target: None,
                    expected_hash: hash_hex.clone(),
                },
                DedupStrategy::LinkReplace => Operation {
                    kind: OpKind::LinkReplace,
                    source: member.path.clone(),
                    target: Some(canonical_path.clone()),
                    expected_hash: hash_hex.clone(),
                },
                DedupStrategy::Move { target_dir } => Operation {
                    kind: OpKind::Move,
                    source: member.path.clone(),
                    target: Some(quarantine_target(target_dir, &hash_hex, i, &member.path)),
                    expected_hash: hash_hex.clone(),
                },
            };
            operations.push(operation);
        }
    }

    check_conflicts(&operations)?;
    debug!(
        "Planned {} operations across {} groups",
        operations.len(),
        groups.len()
    );
    Ok(ActionPlan {
        transaction_id: None,
        algorithm,
        operations,
    })
}

/// Quarantine file name: hash prefix + member index keep same-named files
/// from different directories apart.
fn quarantine_target(target_dir: &Path, hash_hex: &str, index: usize, source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let prefix: String = hash_hex.chars().take(12).collect();
    target_dir.join(format!("{}-{}-{}", prefix, index, name))
}

fn check_conflicts(operations: &[Operation]) -> Result<()> {
    let mut sources: HashSet<&Path> = HashSet::new();
    let mut move_targets: HashSet<&Path> = HashSet::new();
    // Many link-replace ops may share one canonical target; that is the
    // normal shape of a group, not a conflict.
    let mut link_targets: HashSet<&Path> = HashSet::new();

    for op in operations {
        if !sources.insert(&op.source) {
            return Err(Error::PlanConflict {
                path: op.source.clone(),
            });
        }
        match (op.kind, &op.target) {
            (OpKind::Move, Some(target)) => {
                if !move_targets.insert(target) {
                    return Err(Error::PlanConflict {
                        path: target.clone(),
                    });
                }
            }
            (OpKind::LinkReplace, Some(target)) => {
                link_targets.insert(target);
            }
            _ => {}
        }
    }
    // A move target that is also a source, or that would overwrite a
    // canonical file other operations link to, would collide.
    for target in &move_targets {
        if sources.contains(*target) || link_targets.contains(*target) {
            return Err(Error::PlanConflict {
                path: target.to_path_buf(),
            });
        }
    }
    // Link-replace must never point at a path this plan removes.
    for target in &link_targets {
        if sources.contains(*target) {
            return Err(Error::PlanConflict {
                path: target.to_path_buf(),
            });
        }
    }
    Ok(())
}
