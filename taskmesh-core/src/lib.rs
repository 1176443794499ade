//! TaskMesh core: serverless task-list synchronization
//!
//! Devices carrying replicas of a hierarchical task list find each
//! other (over LAN proximity beacons or through a rendezvous relay),
//! negotiate direct data channels, and keep their replicas converged
//! by broadcasting whole-tree snapshots on every local mutation.
//!
//! The [`core_sync::SyncEngine`] is the entry point; everything else
//! supports it:
//!
//! - [`core_model`]: the task tree and its snapshot encoding
//! - [`core_discovery`]: proximity and rendezvous peer discovery
//! - [`core_signal`]: signaling envelopes, framing, and the relay
//! - [`core_connect`]: negotiation, data channels, and the registry

pub mod config;
pub mod core_connect;
pub mod core_discovery;
pub mod core_model;
pub mod core_signal;
pub mod core_sync;
pub mod logging;
pub mod test_utils;

pub use config::Config;
pub use core_model::{Task, TaskTree};
pub use core_sync::{EngineHandle, SyncEngine, SyncError, SyncResult, SyncStrategy};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure the main exports are accessible
        let _ = LogLevel::Info;
        let _ = SyncStrategy::Rendezvous;
        let _ = Config::default();
    }
}
