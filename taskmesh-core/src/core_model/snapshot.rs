//! Snapshot encoding and opaque persistence
//!
//! Snapshots are the full task tree as a UTF-8 JSON array of task
//! records, the canonical payload for both replication and the
//! persisted record kept by the storage collaborator.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use super::task::{Task, TaskTree};

/// Failure to decode an incoming snapshot payload
///
/// Decode failures are fail-safe: the caller must leave the existing
/// local tree untouched.
#[derive(Debug, Clone, Error)]
#[error("Failed to decode task snapshot: {0}")]
pub struct SnapshotDecodeError(pub String);

/// Encode the full tree as canonical UTF-8 JSON
pub fn encode_snapshot(tree: &TaskTree) -> String {
    // Vec<Task> serialization is infallible: no maps with non-string
    // keys, no non-finite floats.
    serde_json::to_string(&tree.tasks).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a received payload into a task list
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<Task>, SnapshotDecodeError> {
    serde_json::from_slice(bytes).map_err(|e| SnapshotDecodeError(e.to_string()))
}

/// Opaque load/save of the serialized task tree
///
/// The durable implementation lives with the excluded storage
/// collaborator; the engine only ever sees one record under one fixed
/// key.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist the serialized tree
    async fn save(&self, snapshot: &str) -> Result<(), String>;

    /// Load the previously persisted tree, if any
    async fn load(&self) -> Result<Option<String>, String>;
}

/// In-memory store for tests and local-only operation
#[derive(Default)]
pub struct MemorySnapshotStore {
    record: Arc<RwLock<Option<String>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &str) -> Result<(), String> {
        *self.record.write().await = Some(snapshot.to_string());
        Ok(())
    }

    async fn load(&self) -> Result<Option<String>, String> {
        Ok(self.record.read().await.clone())
    }
}
