//! The synchronization engine and its replication policy

pub mod engine;
pub mod errors;
pub mod replication;

pub use engine::{EngineHandle, SyncEngine, SyncStrategy};
pub use errors::{SyncError, SyncResult};
pub use replication::Replicator;
