//! Implicit discovery through the rendezvous relay
//!
//! There is no scan step: the relay is the discovery substrate, and
//! "finding" a peer means observing a `join` envelope for the local
//! group. The engine feeds relay joins into [`RendezvousDiscovery`],
//! which emits the same [`DiscoveryEvent`]s the proximity provider
//! would.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{DiscoveryEvent, DiscoveryProvider, DiscoveryUnavailable};
use crate::core_model::{GroupId, PeerId};

/// Join-driven discovery provider
pub struct RendezvousDiscovery {
    event_tx: mpsc::Sender<DiscoveryEvent>,
    local_peer_id: Option<PeerId>,
    group: Option<GroupId>,
}

impl RendezvousDiscovery {
    pub fn new(event_tx: mpsc::Sender<DiscoveryEvent>) -> Self {
        Self {
            event_tx,
            local_peer_id: None,
            group: None,
        }
    }

    /// Scope discovery to the device's current group
    pub fn set_group(&mut self, group: Option<GroupId>) {
        self.group = group;
    }

    /// A `join` envelope was observed on the relay
    ///
    /// Emits `PeerFound` when it names the local group and came from
    /// another device. The data address is unknown at this point; the
    /// negotiation exchange will learn it.
    ///
    /// Called from the same task that drains the event channel, so it
    /// must never wait for capacity. A join dropped on overflow is
    /// recoverable; the peer's follow-up offer still registers it.
    pub fn observe_join(&self, collection_id: &GroupId, sender_id: &PeerId) {
        if self.group.as_ref() != Some(collection_id) {
            debug!(collection = %collection_id, "Join for foreign collection, ignoring");
            return;
        }
        if self.local_peer_id.as_ref() == Some(sender_id) {
            return;
        }
        if self
            .event_tx
            .try_send(DiscoveryEvent::PeerFound {
                peer_id: sender_id.clone(),
                name: sender_id.to_string(),
                data_addr: None,
            })
            .is_err()
        {
            debug!(peer_id = %sender_id, "Discovery queue full, dropping join");
        }
    }
}

#[async_trait]
impl DiscoveryProvider for RendezvousDiscovery {
    async fn start(&mut self, _local_display_name: &str) -> Result<PeerId, DiscoveryUnavailable> {
        // This strategy generates its own random device id rather than
        // receiving one from a radio subsystem.
        let peer_id = PeerId::generate();
        self.local_peer_id = Some(peer_id.clone());
        info!(peer_id = %peer_id, "Rendezvous discovery started");
        Ok(peer_id)
    }

    async fn stop(&mut self) {
        if self.local_peer_id.take().is_some() {
            info!("Rendezvous discovery stopped");
        }
        self.group = None;
    }
}
