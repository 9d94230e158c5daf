//! Checkpointed file state for orchestrated runs.
//!
//! Tracked files are snapshotted into content-addressed blobs; a checkpoint
//! is an id plus a map from tracked path to blob hash, persisted in a JSON
//! index so it survives restarts.

mod blob;
mod checkpoint;
mod manager;

pub use blob::{content_hash, BlobStore, FsBlobStore, MemoryBlobStore};
pub use checkpoint::{Checkpoint, CheckpointId, CheckpointIndex};
pub use manager::StateManager;
