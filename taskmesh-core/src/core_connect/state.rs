//! Per-peer connection lifecycle

use std::fmt;

/// Lifecycle of a peer connection
///
/// `Disconnected` is terminal: the registry evicts the entry rather
/// than keeping it around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Peer is known from discovery but no negotiation has started.
    /// This phase ends before registration: the engine connects
    /// eagerly, so entries enter the registry already `Connecting`.
    Discovered,
    /// Negotiation/handshake in progress
    Connecting,
    /// Data channel established and usable
    Connected,
    /// Terminal: transport closed, negotiation failed, or timed out
    Disconnected,
}

impl PeerState {
    /// Whether the transition to `next` is allowed by the state machine
    pub fn can_transition_to(self, next: PeerState) -> bool {
        use PeerState::*;
        matches!(
            (self, next),
            (Discovered, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Discovered => "discovered",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
            PeerState::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PeerState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(Discovered.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Discovered.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
    }
}
