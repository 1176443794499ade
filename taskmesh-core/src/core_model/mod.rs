//! Task tree model, identifiers, and snapshot codec

pub mod ids;
pub mod snapshot;
pub mod task;

pub use ids::{GroupId, PeerId, TaskId};
pub use snapshot::{
    decode_snapshot, encode_snapshot, MemorySnapshotStore, SnapshotDecodeError, SnapshotStore,
};
pub use task::{Task, TaskTree};
