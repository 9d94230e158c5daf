//! Content-addressed blob storage.
//!
//! Blobs are keyed by the lowercase hex SHA-256 of their bytes, so identical
//! file contents captured by different checkpoints are stored once.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::clog_trace;

/// Hash used as the blob key for `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn validate_hash(hash: &str) -> Result<()> {
    if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid blob hash: {}", hash)))
    }
}

/// Storage backend for checkpoint contents.
///
/// Implementations only move bytes; integrity checking is the caller's job.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `hash`. Storing an existing hash is a no-op.
    async fn put(&self, hash: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch the bytes stored under `hash`, `None` if absent.
    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>>;

    async fn exists(&self, hash: &str) -> Result<bool>;
}

/// Blob store on the local filesystem, sharded by the first two hex digits.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        validate_hash(hash)?;
        Ok(self.root.join(&hash[..2]).join(hash))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(hash)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a crash never leaves a truncated blob under
        // its final name.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        clog_trace!("FsBlobStore::put {} ({} bytes)", hash, bytes.len());
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(hash)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        let path = self.blob_path(hash)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Overwrite a stored blob in place, bypassing content addressing.
    ///
    /// Only meaningful for simulating corruption.
    pub async fn tamper(&self, hash: &str, bytes: Vec<u8>) {
        self.blobs.write().await.insert(hash.to_string(), bytes);
    }

    pub async fn remove(&self, hash: &str) -> bool {
        self.blobs.write().await.remove(hash).is_some()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        self.blobs
            .write()
            .await
            .entry(hash.to_string())
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    async fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(hash).cloned())
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(hash))
    }
}
