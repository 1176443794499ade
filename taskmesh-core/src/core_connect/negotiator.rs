//! Connection negotiation strategies
//!
//! A negotiator turns a discovered peer into an established data
//! channel. It is deliberately pure: every input returns a list of
//! [`NegotiationAction`]s for the engine to execute, which keeps the
//! state machine synchronous, single-writer, and directly testable.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::core_model::PeerId;
use crate::core_signal::SignalingEnvelope;

/// Side effects requested by a negotiator
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationAction {
    /// Forward an envelope through the relay
    SendEnvelope(SignalingEnvelope),
    /// Dial the peer's data listener
    Dial { peer_id: PeerId, addr: String },
}

/// A strategy for establishing a channel to a discovered peer
pub trait Negotiator: Send {
    /// A peer was discovered (proximity scan hit, or a `join` for the
    /// local group)
    fn on_peer_found(&mut self, peer_id: &PeerId, data_addr: Option<&str>)
        -> Vec<NegotiationAction>;

    /// A signaling envelope arrived from the relay
    fn on_envelope(&mut self, envelope: &SignalingEnvelope) -> Vec<NegotiationAction>;

    /// The data channel for this peer opened; negotiation is done
    fn on_channel_open(&mut self, peer_id: &PeerId);

    /// Abandon one in-flight negotiation
    fn abandon(&mut self, peer_id: &PeerId);

    /// Abandon every in-flight negotiation (signaling went away);
    /// returns the affected peers
    fn abandon_all(&mut self) -> Vec<PeerId>;

    /// Pop negotiations that have exceeded their deadline
    fn expired(&mut self, timeout: Duration) -> Vec<PeerId>;
}

/// Proximity negotiation: an implicit connect/accept handshake
///
/// Discovery already delivered the peer's data address, so negotiation
/// collapses to one eager dial. Inbound connects are auto-accepted by
/// the data listener.
#[derive(Default)]
pub struct ProximityNegotiator {
    in_flight: HashMap<PeerId, Instant>,
}

impl ProximityNegotiator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Negotiator for ProximityNegotiator {
    fn on_peer_found(
        &mut self,
        peer_id: &PeerId,
        data_addr: Option<&str>,
    ) -> Vec<NegotiationAction> {
        let Some(addr) = data_addr else {
            debug!(peer_id = %peer_id, "Proximity peer without data address, ignoring");
            return Vec::new();
        };
        self.in_flight.insert(peer_id.clone(), Instant::now());
        vec![NegotiationAction::Dial {
            peer_id: peer_id.clone(),
            addr: addr.to_string(),
        }]
    }

    fn on_envelope(&mut self, _envelope: &SignalingEnvelope) -> Vec<NegotiationAction> {
        // Proximity negotiation never touches the relay.
        Vec::new()
    }

    fn on_channel_open(&mut self, peer_id: &PeerId) {
        self.in_flight.remove(peer_id);
    }

    fn abandon(&mut self, peer_id: &PeerId) {
        self.in_flight.remove(peer_id);
    }

    fn abandon_all(&mut self) -> Vec<PeerId> {
        self.in_flight.drain().map(|(id, _)| id).collect()
    }

    fn expired(&mut self, timeout: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .in_flight
            .iter()
            .filter(|(_, started)| now.duration_since(**started) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in &stale {
            self.in_flight.remove(peer_id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_found_dials_eagerly() {
        let mut negotiator = ProximityNegotiator::new();
        let actions =
            negotiator.on_peer_found(&PeerId::from("A"), Some("127.0.0.1:4000"));
        assert_eq!(
            actions,
            vec![NegotiationAction::Dial {
                peer_id: PeerId::from("A"),
                addr: "127.0.0.1:4000".to_string(),
            }]
        );
    }

    #[test]
    fn test_peer_found_without_address_is_ignored() {
        let mut negotiator = ProximityNegotiator::new();
        assert!(negotiator.on_peer_found(&PeerId::from("A"), None).is_empty());
        assert!(negotiator.abandon_all().is_empty());
    }

    #[test]
    fn test_expiry_pops_stale_negotiations() {
        let mut negotiator = ProximityNegotiator::new();
        negotiator.on_peer_found(&PeerId::from("A"), Some("127.0.0.1:4000"));

        assert!(negotiator.expired(Duration::from_secs(60)).is_empty());
        assert_eq!(
            negotiator.expired(Duration::ZERO),
            vec![PeerId::from("A")]
        );
        // Popped: a second sweep is empty.
        assert!(negotiator.expired(Duration::ZERO).is_empty());
    }

    #[test]
    fn test_channel_open_clears_in_flight() {
        let mut negotiator = ProximityNegotiator::new();
        negotiator.on_peer_found(&PeerId::from("A"), Some("127.0.0.1:4000"));
        negotiator.on_channel_open(&PeerId::from("A"));
        assert!(negotiator.abandon_all().is_empty());
    }
}
