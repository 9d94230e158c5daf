//! Checkpoint records and the persisted checkpoint index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Checkpoint identifier: a zero-padded sequence number plus the creation
/// time in milliseconds, e.g. `cp-000003-1739954400123`.
///
/// The sequence makes ids strictly monotonic within a store even when the
/// clock does not advance between two checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    pub fn new(seq: u64, at: DateTime<Utc>) -> Self {
        Self(format!("cp-{:06}-{}", seq, at.timestamp_millis()))
    }

    /// Sequence number encoded in the id, if it has the expected shape.
    pub fn sequence(&self) -> Option<u64> {
        self.0.strip_prefix("cp-")?.split('-').next()?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CheckpointId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CheckpointId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Immutable snapshot of the tracked files at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub label: String,
    /// Tracked path (relative to the project root) -> content hash.
    pub file_snapshots: BTreeMap<PathBuf, String>,
    /// Tracked paths that did not exist when the checkpoint was taken.
    #[serde(default)]
    pub absent_files: BTreeSet<PathBuf>,
    /// Skills checkpointed so far, oldest first, ending with the skill
    /// this checkpoint was taken for.
    #[serde(default)]
    pub skill_stack: Vec<String>,
    /// Execution context at checkpoint time.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// `project_root` and `tracked_files_count`.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn file_count(&self) -> usize {
        self.file_snapshots.len()
    }

    /// Whether the checkpoint covers `path` (present or absent).
    pub fn covers(&self, path: &Path) -> bool {
        self.file_snapshots.contains_key(path) || self.absent_files.contains(path)
    }
}

/// On-disk form of everything a state manager needs to recover after a
/// crash: the tracked-file registry and all live checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub next_sequence: u64,
    #[serde(default)]
    pub tracked_files: BTreeSet<PathBuf>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub skill_stack: Vec<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl CheckpointIndex {
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the index atomically (temp file + rename).
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
