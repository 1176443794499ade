//! Error taxonomy for the synchronization engine
//!
//! Nothing here is fatal to the process: discovery and relay failures
//! degrade to "no peers", per-peer failures evict only that peer, and
//! decode failures never touch local state. The worst outcome is "no
//! synchronization", never a crash.

use thiserror::Error;

use crate::config::ConfigError;
use crate::core_discovery::DiscoveryUnavailable;
use crate::core_model::{PeerId, SnapshotDecodeError};

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by the synchronization engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Discovery could not start; the engine runs with zero peers
    #[error(transparent)]
    DiscoveryUnavailable(#[from] DiscoveryUnavailable),

    /// The relay connection is down; dependent negotiations are
    /// abandoned
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// A peer stayed in Connecting past the configured deadline
    #[error("Negotiation with peer {peer_id} timed out")]
    NegotiationTimeout { peer_id: PeerId },

    /// Offer/answer/candidate exchange failed for one peer
    #[error("Negotiation with peer {peer_id} failed: {reason}")]
    NegotiationFailed { peer_id: PeerId, reason: String },

    /// An incoming snapshot payload could not be decoded; the local
    /// tree was left unchanged
    #[error(transparent)]
    ReplicationDecode(#[from] SnapshotDecodeError),

    /// A peer's data channel closed or failed
    #[error("Transport closed for peer {peer_id}")]
    TransportClosed { peer_id: PeerId },

    /// Invalid engine configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The requested operation needs the rendezvous strategy
    #[error("Operation requires the rendezvous strategy: {0}")]
    WrongStrategy(String),

    /// The engine task is gone or its channels are closed
    #[error("Engine unavailable: {0}")]
    Engine(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::NegotiationTimeout {
            peer_id: PeerId::from("C"),
        };
        assert_eq!(err.to_string(), "Negotiation with peer C timed out");

        let err = SyncError::SignalingUnavailable("relay connection is down".to_string());
        assert!(err.to_string().contains("Signaling unavailable"));
    }

    #[test]
    fn test_decode_error_conversion() {
        let decode = SnapshotDecodeError("bad payload".to_string());
        let err: SyncError = decode.into();
        assert!(matches!(err, SyncError::ReplicationDecode(_)));
    }
}
