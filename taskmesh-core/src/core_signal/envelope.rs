//! Signaling envelopes exchanged through the rendezvous relay
//!
//! JSON tagged union keyed by `type`, with camelCase field names. The
//! envelope set mirrors the classic offer/answer/candidate exchange:
//! `register` announces a device to the relay, `join` announces entry
//! into a collection, and the remaining three negotiate one direct
//! connection between two peers.

use serde::{Deserialize, Serialize};

use crate::core_model::{GroupId, PeerId};

/// Which side of the negotiation a description came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Session description: how to reach the describing peer's data
/// listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    /// Address the describing peer accepts data channels on
    pub listen_addr: String,
}

/// One candidate transport address for the sending peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInfo {
    pub address: String,
}

/// A signaling message in flight over the relay connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalingEnvelope {
    /// Device announces itself to the relay on connect
    #[serde(rename_all = "camelCase")]
    Register { peer_id: PeerId },

    /// Device announces it entered a collection; the relay fans this
    /// out to every other registered device, which filters by its own
    /// collection id
    #[serde(rename_all = "camelCase")]
    Join {
        collection_id: GroupId,
        sender_id: PeerId,
    },

    /// Existing member opens a negotiation toward a joiner
    #[serde(rename_all = "camelCase")]
    Offer {
        offer: SessionDescription,
        sender_id: PeerId,
        receiver_id: PeerId,
        collection_id: GroupId,
    },

    /// Joiner's response to an offer
    #[serde(rename_all = "camelCase")]
    Answer {
        answer: SessionDescription,
        sender_id: PeerId,
        receiver_id: PeerId,
    },

    /// Transport candidate, streamed as each side produces them
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: CandidateInfo,
        sender_id: PeerId,
        receiver_id: PeerId,
    },
}

impl SignalingEnvelope {
    /// Peer the relay should forward this envelope to, when targeted
    pub fn receiver(&self) -> Option<&PeerId> {
        match self {
            SignalingEnvelope::Offer { receiver_id, .. }
            | SignalingEnvelope::Answer { receiver_id, .. }
            | SignalingEnvelope::Candidate { receiver_id, .. } => Some(receiver_id),
            _ => None,
        }
    }

    /// Peer that produced this envelope, when carried on the wire
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            SignalingEnvelope::Join { sender_id, .. }
            | SignalingEnvelope::Offer { sender_id, .. }
            | SignalingEnvelope::Answer { sender_id, .. }
            | SignalingEnvelope::Candidate { sender_id, .. } => Some(sender_id),
            SignalingEnvelope::Register { peer_id } => Some(peer_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_wire_format() {
        let env = SignalingEnvelope::Register {
            peer_id: PeerId::from("A"),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["peerId"], "A");
    }

    #[test]
    fn test_join_wire_format() {
        let env = SignalingEnvelope::Join {
            collection_id: GroupId::from("G-1"),
            sender_id: PeerId::from("B"),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "join");
        assert_eq!(json["collectionId"], "G-1");
        assert_eq!(json["senderId"], "B");
    }

    #[test]
    fn test_offer_wire_format() {
        let env = SignalingEnvelope::Offer {
            offer: SessionDescription {
                kind: DescriptionKind::Offer,
                listen_addr: "127.0.0.1:4000".to_string(),
            },
            sender_id: PeerId::from("A"),
            receiver_id: PeerId::from("B"),
            collection_id: GroupId::from("G-1"),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["offer"]["type"], "offer");
        assert_eq!(json["offer"]["listenAddr"], "127.0.0.1:4000");
        assert_eq!(json["receiverId"], "B");
        assert_eq!(json["collectionId"], "G-1");
    }

    #[test]
    fn test_candidate_round_trip() {
        let env = SignalingEnvelope::Candidate {
            candidate: CandidateInfo {
                address: "127.0.0.1:4001".to_string(),
            },
            sender_id: PeerId::from("A"),
            receiver_id: PeerId::from("B"),
        };
        let bytes = serde_json::to_vec(&env).unwrap();
        let decoded: SignalingEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_receiver_routing() {
        let join = SignalingEnvelope::Join {
            collection_id: GroupId::from("G-1"),
            sender_id: PeerId::from("B"),
        };
        assert!(join.receiver().is_none());

        let answer = SignalingEnvelope::Answer {
            answer: SessionDescription {
                kind: DescriptionKind::Answer,
                listen_addr: "127.0.0.1:4002".to_string(),
            },
            sender_id: PeerId::from("B"),
            receiver_id: PeerId::from("A"),
        };
        assert_eq!(answer.receiver(), Some(&PeerId::from("A")));
    }
}
