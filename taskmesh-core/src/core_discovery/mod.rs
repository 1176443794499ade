//! Peer discovery providers
//!
//! Two interchangeable strategies behind one interface:
//!
//! - [`ProximityDiscovery`] advertises and scans on the local network
//!   with UDP broadcast beacons (the nearby-devices strategy).
//! - [`RendezvousDiscovery`] is implicit: "finding" a peer means the
//!   relay forwarded a `join` envelope for the local group.
//!
//! Both emit [`DiscoveryEvent`]s onto the engine's serialized control
//! flow; the engine applies the eager-connect policy on `PeerFound`.

pub mod proximity;
pub mod rendezvous;

use async_trait::async_trait;
use thiserror::Error;

use crate::core_model::PeerId;

pub use proximity::ProximityDiscovery;
pub use rendezvous::RendezvousDiscovery;

/// Discovery failed to start; the engine degrades to local-only mode
#[derive(Debug, Clone, Error)]
#[error("Discovery unavailable: {0}")]
pub struct DiscoveryUnavailable(pub String);

/// Events produced by a discovery provider
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    PeerFound {
        peer_id: PeerId,
        name: String,
        /// Data-channel address, when the strategy learns it during
        /// discovery (proximity beacons carry it; rendezvous learns
        /// addresses later, during negotiation)
        data_addr: Option<String>,
    },
    PeerLost {
        peer_id: PeerId,
    },
}

/// A strategy for advertising local presence and finding peers
#[async_trait]
pub trait DiscoveryProvider: Send {
    /// Start advertising and scanning; returns the local peer id
    async fn start(&mut self, local_display_name: &str) -> Result<PeerId, DiscoveryUnavailable>;

    /// Stop advertising and scanning
    async fn stop(&mut self);
}
