//! StateManager - content-addressed checkpoints over tracked files.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::util::blocking;
use crate::{clog, clog_debug, clog_warn};

use super::blob::{content_hash, BlobStore, FsBlobStore};
use super::checkpoint::{Checkpoint, CheckpointId, CheckpointIndex};

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";

/// Mutable state guarded by the manager's lock.
#[derive(Debug, Default)]
struct Registry {
    tracked: BTreeSet<PathBuf>,
    checkpoints: Vec<Checkpoint>,
    next_sequence: u64,
    skill_stack: Vec<String>,
    context: Map<String, Value>,
}

impl Registry {
    fn from_index(index: CheckpointIndex) -> Self {
        let max_seen = index
            .checkpoints
            .iter()
            .filter_map(|cp| cp.id.sequence())
            .max()
            .map(|s| s + 1)
            .unwrap_or(0);
        Self {
            tracked: index.tracked_files,
            checkpoints: index.checkpoints,
            next_sequence: index.next_sequence.max(max_seen),
            skill_stack: index.skill_stack,
            context: index.context,
        }
    }

    fn to_index(&self) -> CheckpointIndex {
        CheckpointIndex {
            next_sequence: self.next_sequence,
            tracked_files: self.tracked.clone(),
            checkpoints: self.checkpoints.clone(),
            skill_stack: self.skill_stack.clone(),
            context: self.context.clone(),
        }
    }

    fn find(&self, id: &CheckpointId) -> Result<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|cp| &cp.id == id)
            .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))
    }
}

/// Manages checkpoints of an explicitly registered set of tracked files.
///
/// All reads and writes of the tracked-file registry and the checkpoint
/// index go through one lock, so a checkpoint never observes a half-applied
/// restore and vice versa.
///
/// # Example
///
/// ```ignore
/// let manager = StateManager::open(project_root, &state_dir).await?;
/// manager.track("config.json").await?;
///
/// manager.update_context("target", json!("staging")).await?;
///
/// let checkpoint = manager.create_checkpoint("before_migration", Some("migrate")).await?;
/// // ... work ...
/// manager.restore_checkpoint(&checkpoint.id).await?;
/// ```
pub struct StateManager {
    project_root: PathBuf,
    store: Arc<dyn BlobStore>,
    index_path: Option<PathBuf>,
    registry: Mutex<Registry>,
}

impl StateManager {
    /// Create a manager whose index lives only in memory.
    pub fn new(project_root: impl Into<PathBuf>, store: Arc<dyn BlobStore>) -> Self {
        Self {
            project_root: project_root.into(),
            store,
            index_path: None,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Open a persistent manager with blobs and index under `state_dir`.
    ///
    /// An existing index is reloaded, so checkpoints survive restarts.
    pub async fn open(project_root: impl Into<PathBuf>, state_dir: &Path) -> Result<Self> {
        let store = Arc::new(FsBlobStore::new(state_dir.join(BLOB_DIR)));
        Self::open_with_store(project_root, store, state_dir.join(INDEX_FILE)).await
    }

    /// Open a persistent manager over an arbitrary blob store.
    pub async fn open_with_store(
        project_root: impl Into<PathBuf>,
        store: Arc<dyn BlobStore>,
        index_path: PathBuf,
    ) -> Result<Self> {
        let project_root = project_root.into();
        let registry = match CheckpointIndex::load(&index_path).await? {
            Some(index) => {
                clog_debug!(
                    "StateManager: recovered {} checkpoints, {} tracked files from {}",
                    index.checkpoints.len(),
                    index.tracked_files.len(),
                    index_path.display()
                );
                Registry::from_index(index)
            }
            None => Registry::default(),
        };

        clog_debug!("StateManager::open root={}", project_root.display());
        Ok(Self {
            project_root,
            store,
            index_path: Some(index_path),
            registry: Mutex::new(registry),
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Normalize a path to be relative to the project root.
    ///
    /// Paths escaping the root are rejected; restoring must never write
    /// outside the project.
    fn relative(&self, path: &Path) -> Result<PathBuf> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.project_root)
                .map_err(|_| {
                    Error::Validation(format!(
                        "{} is outside project root {}",
                        path.display(),
                        self.project_root.display()
                    ))
                })?
                .to_path_buf()
        } else {
            path.to_path_buf()
        };

        let mut clean = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "tracked path must stay inside the project: {}",
                        path.display()
                    )))
                }
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(Error::Validation("tracked path must name a file".to_string()));
        }
        Ok(clean)
    }

    async fn persist(&self, registry: &Registry) -> Result<()> {
        if let Some(path) = &self.index_path {
            registry.to_index().save(path).await?;
        }
        Ok(())
    }

    /// Register a file to be captured by future checkpoints.
    ///
    /// The file need not exist yet. Returns `false` if already tracked.
    pub async fn track(&self, path: impl AsRef<Path>) -> Result<bool> {
        let rel = self.relative(path.as_ref())?;
        let mut registry = self.registry.lock().await;
        if !registry.tracked.insert(rel.clone()) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&registry).await {
            registry.tracked.remove(&rel);
            return Err(e);
        }
        clog_debug!("StateManager: tracking {}", rel.display());
        Ok(true)
    }

    /// Stop tracking a file. Existing checkpoints keep their snapshot of it.
    pub async fn untrack(&self, path: impl AsRef<Path>) -> Result<bool> {
        let rel = self.relative(path.as_ref())?;
        let mut registry = self.registry.lock().await;
        if !registry.tracked.remove(&rel) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&registry).await {
            registry.tracked.insert(rel);
            return Err(e);
        }
        Ok(true)
    }

    pub async fn tracked_files(&self) -> Vec<PathBuf> {
        self.registry.lock().await.tracked.iter().cloned().collect()
    }

    /// Set one key of the execution context captured by future checkpoints.
    pub async fn update_context(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        let mut registry = self.registry.lock().await;
        let previous = registry.context.insert(key.clone(), value);
        if let Err(e) = self.persist(&registry).await {
            match previous {
                Some(old) => registry.context.insert(key, old),
                None => registry.context.remove(&key),
            };
            return Err(e);
        }
        clog_debug!("StateManager: context key {} updated", key);
        Ok(())
    }

    /// Current execution context.
    pub async fn context(&self) -> Map<String, Value> {
        self.registry.lock().await.context.clone()
    }

    /// Skills checkpointed so far, oldest first.
    pub async fn skill_stack(&self) -> Vec<String> {
        self.registry.lock().await.skill_stack.clone()
    }

    /// Snapshot every tracked file into a new checkpoint.
    ///
    /// `skill_name`, when given, is pushed onto the skill stack recorded in
    /// this and later checkpoints. Blobs already in the store are not
    /// written again. The index is persisted before the checkpoint becomes
    /// visible.
    pub async fn create_checkpoint(&self, label: &str, skill_name: Option<&str>) -> Result<Checkpoint> {
        let mut registry = self.registry.lock().await;

        let mut file_snapshots = BTreeMap::new();
        let mut absent_files = BTreeSet::new();
        let mut stored = 0usize;

        for rel in &registry.tracked {
            let full = self.project_root.join(rel);
            let bytes = match tokio::fs::read(&full).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    absent_files.insert(rel.clone());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let (hash, bytes) = blocking(move || Ok((content_hash(&bytes), bytes))).await?;
            if !self.store.exists(&hash).await? {
                self.store.put(&hash, &bytes).await?;
                stored += 1;
            }
            file_snapshots.insert(rel.clone(), hash);
        }

        let mut skill_stack = registry.skill_stack.clone();
        skill_stack.extend(skill_name.map(str::to_string));

        let mut metadata = Map::new();
        metadata.insert(
            "project_root".to_string(),
            json!(self.project_root.display().to_string()),
        );
        metadata.insert("tracked_files_count".to_string(), json!(registry.tracked.len()));

        let created_at = Utc::now();
        let checkpoint = Checkpoint {
            id: CheckpointId::new(registry.next_sequence, created_at),
            label: label.to_string(),
            file_snapshots,
            absent_files,
            skill_stack: skill_stack.clone(),
            context: registry.context.clone(),
            metadata,
            created_at,
        };

        let previous_stack = std::mem::replace(&mut registry.skill_stack, skill_stack);
        registry.checkpoints.push(checkpoint.clone());
        registry.next_sequence += 1;
        if let Err(e) = self.persist(&registry).await {
            registry.checkpoints.pop();
            registry.next_sequence -= 1;
            registry.skill_stack = previous_stack;
            return Err(e);
        }

        clog!(
            "Checkpoint created: {} '{}' ({} files, {} new blobs, stack depth {})",
            checkpoint.id,
            label,
            checkpoint.file_count(),
            stored,
            checkpoint.skill_stack.len()
        );
        Ok(checkpoint)
    }

    /// Load and hash-check every blob of a checkpoint.
    async fn load_blobs(&self, checkpoint: &Checkpoint) -> Result<Vec<(PathBuf, Vec<u8>)>> {
        let mut files = Vec::with_capacity(checkpoint.file_snapshots.len());
        for (rel, hash) in &checkpoint.file_snapshots {
            let corrupt = |reason: String| Error::CheckpointCorrupt {
                id: checkpoint.id.to_string(),
                reason,
            };
            let bytes = self
                .store
                .get(hash)
                .await?
                .ok_or_else(|| corrupt(format!("blob {} for {} is missing", hash, rel.display())))?;

            let expected = hash.clone();
            let (actual, bytes) = blocking(move || Ok((content_hash(&bytes), bytes))).await?;
            if actual != expected {
                return Err(corrupt(format!(
                    "blob for {} hashes to {} instead of {}",
                    rel.display(),
                    actual,
                    expected
                )));
            }
            files.push((rel.clone(), bytes));
        }
        Ok(files)
    }

    /// Restore the tracked files captured by a checkpoint, along with its
    /// skill stack and execution context.
    ///
    /// Every blob is validated before any live file is written, so a
    /// corrupt checkpoint leaves the project untouched. Files the checkpoint
    /// did not cover are never modified.
    pub async fn restore_checkpoint(&self, id: &CheckpointId) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let checkpoint = registry.find(id)?.clone();

        clog!("Restoring checkpoint {} '{}'", checkpoint.id, checkpoint.label);
        let files = self.load_blobs(&checkpoint).await?;

        for (rel, bytes) in files {
            let full = self.project_root.join(&rel);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, bytes).await?;
            clog_debug!("Restored {}", rel.display());
        }

        for rel in &checkpoint.absent_files {
            match tokio::fs::remove_file(self.project_root.join(rel)).await {
                Ok(()) => clog_debug!("Removed {} (absent at checkpoint)", rel.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        registry.skill_stack = checkpoint.skill_stack;
        registry.context = checkpoint.context;
        self.persist(&registry).await?;
        drop(registry);
        clog!("Checkpoint restored: {}", id);
        Ok(())
    }

    /// Check a checkpoint's blobs, reporting what is wrong.
    ///
    /// # Errors
    /// `CheckpointNotFound` for an unknown id, `CheckpointCorrupt` when a
    /// blob is missing or does not match its recorded hash.
    pub async fn check_checkpoint(&self, id: &CheckpointId) -> Result<()> {
        let checkpoint = self.registry.lock().await.find(id)?.clone();
        self.load_blobs(&checkpoint).await.map(|_| ())
    }

    /// Whether every blob of a checkpoint is present and intact.
    ///
    /// Does not look at live files. Any storage problem yields `false`;
    /// only an unknown id is an error.
    pub async fn verify_checkpoint(&self, id: &CheckpointId) -> Result<bool> {
        match self.check_checkpoint(id).await {
            Ok(()) => Ok(true),
            Err(e @ Error::CheckpointNotFound(_)) => Err(e),
            Err(e) => {
                clog_warn!("Checkpoint {} failed verification: {}", id, e);
                Ok(false)
            }
        }
    }

    /// Tracked paths covered by a checkpoint whose live state differs from it.
    pub async fn changed_since(&self, id: &CheckpointId) -> Result<Vec<PathBuf>> {
        let checkpoint = self.registry.lock().await.find(id)?.clone();
        let mut changed = Vec::new();

        for (rel, hash) in &checkpoint.file_snapshots {
            match tokio::fs::read(self.project_root.join(rel)).await {
                Ok(bytes) => {
                    if &content_hash(&bytes) != hash {
                        changed.push(rel.clone());
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => changed.push(rel.clone()),
                Err(e) => return Err(e.into()),
            }
        }
        for rel in &checkpoint.absent_files {
            if tokio::fs::try_exists(self.project_root.join(rel)).await? {
                changed.push(rel.clone());
            }
        }
        changed.sort();
        Ok(changed)
    }

    /// All checkpoints in creation order.
    pub async fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.registry.lock().await.checkpoints.clone()
    }

    pub async fn get_checkpoint(&self, id: &CheckpointId) -> Option<Checkpoint> {
        self.registry.lock().await.find(id).ok().cloned()
    }

    /// Invalidate a checkpoint. Its blobs stay in the store.
    pub async fn delete_checkpoint(&self, id: &CheckpointId) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let pos = registry
            .checkpoints
            .iter()
            .position(|cp| &cp.id == id)
            .ok_or_else(|| Error::CheckpointNotFound(id.to_string()))?;

        let removed = registry.checkpoints.remove(pos);
        if let Err(e) = self.persist(&registry).await {
            registry.checkpoints.insert(pos, removed);
            return Err(e);
        }
        clog!("Checkpoint deleted: {}", id);
        Ok(())
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("project_root", &self.project_root)
            .field("index_path", &self.index_path)
            .finish()
    }
}
