//! Rendezvous negotiation: offer/answer/candidate exchange
//!
//! The full dance for one pair of peers, relayed through the
//! rendezvous service:
//!
//! 1. An existing member of the group observes the joiner's `join`
//!    and sends an `offer` (the joiner never initiates).
//! 2. The joiner, on first seeing the offerer, creates its own local
//!    session, records the remote description, and answers.
//! 3. Each side streams its transport candidates as it produces them.
//!    Candidates are applied in arrival order; a candidate that
//!    arrives before the remote description exists is queued and
//!    replayed, in order, once it is set. Never dropped.
//! 4. Once the offerer has the answer and a viable candidate it dials
//!    the candidate address; the channel opening on both ends
//!    completes the negotiation.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::negotiator::{NegotiationAction, Negotiator};
use crate::core_model::{GroupId, PeerId};
use crate::core_signal::{
    CandidateInfo, DescriptionKind, SessionDescription, SignalingEnvelope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offerer,
    Answerer,
}

/// Per-peer negotiation bookkeeping
struct Session {
    role: Role,
    remote_description: Option<SessionDescription>,
    /// Candidates received before the remote description was set
    pending_candidates: Vec<CandidateInfo>,
    /// Candidates applied so far, in arrival order
    applied_candidates: Vec<CandidateInfo>,
    dialed: bool,
    started_at: Instant,
}

impl Session {
    fn new(role: Role) -> Self {
        Session {
            role,
            remote_description: None,
            pending_candidates: Vec::new(),
            applied_candidates: Vec::new(),
            dialed: false,
            started_at: Instant::now(),
        }
    }
}

/// Negotiator for the rendezvous strategy
pub struct RendezvousNegotiator {
    local_peer_id: PeerId,
    /// Local data-listener address, advertised in descriptions and
    /// candidates
    listen_addr: String,
    group: Option<GroupId>,
    sessions: HashMap<PeerId, Session>,
}

impl RendezvousNegotiator {
    pub fn new(local_peer_id: PeerId, listen_addr: String) -> Self {
        Self {
            local_peer_id,
            listen_addr,
            group: None,
            sessions: HashMap::new(),
        }
    }

    /// Scope the negotiator to the device's current group
    pub fn set_group(&mut self, group: Option<GroupId>) {
        self.group = group;
    }

    pub fn group(&self) -> Option<&GroupId> {
        self.group.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn pending_candidate_count(&self, peer_id: &PeerId) -> usize {
        self.sessions
            .get(peer_id)
            .map(|s| s.pending_candidates.len())
            .unwrap_or(0)
    }

    fn local_description(&self, kind: DescriptionKind) -> SessionDescription {
        SessionDescription {
            kind,
            listen_addr: self.listen_addr.clone(),
        }
    }

    fn local_candidate(&self) -> CandidateInfo {
        CandidateInfo {
            address: self.listen_addr.clone(),
        }
    }

    /// Apply one candidate; the offerer dials the first viable one
    /// once the remote description is in place
    fn apply_candidate(session: &mut Session, peer_id: &PeerId, candidate: CandidateInfo)
        -> Option<NegotiationAction>
    {
        session.applied_candidates.push(candidate.clone());
        if session.role == Role::Offerer
            && session.remote_description.is_some()
            && !session.dialed
        {
            session.dialed = true;
            return Some(NegotiationAction::Dial {
                peer_id: peer_id.clone(),
                addr: candidate.address,
            });
        }
        None
    }

    /// Set the remote description and replay queued candidates in
    /// their original arrival order
    fn set_remote_description(
        session: &mut Session,
        peer_id: &PeerId,
        description: SessionDescription,
    ) -> Vec<NegotiationAction> {
        session.remote_description = Some(description);
        let queued: Vec<CandidateInfo> = session.pending_candidates.drain(..).collect();
        let mut actions = Vec::new();
        for candidate in queued {
            if let Some(action) = Self::apply_candidate(session, peer_id, candidate) {
                actions.push(action);
            }
        }
        actions
    }

    fn handle_offer(
        &mut self,
        sender_id: &PeerId,
        offer: &SessionDescription,
        collection_id: &GroupId,
    ) -> Vec<NegotiationAction> {
        if self.group.as_ref() != Some(collection_id) {
            debug!(sender = %sender_id, collection = %collection_id, "Offer for foreign collection, ignoring");
            return Vec::new();
        }

        // First contact from this peer creates the local session; a
        // candidate may already have arrived and created it for us.
        let session = self
            .sessions
            .entry(sender_id.clone())
            .or_insert_with(|| Session::new(Role::Answerer));

        let mut actions = Self::set_remote_description(session, sender_id, offer.clone());
        actions.push(NegotiationAction::SendEnvelope(SignalingEnvelope::Answer {
            answer: self.local_description(DescriptionKind::Answer),
            sender_id: self.local_peer_id.clone(),
            receiver_id: sender_id.clone(),
        }));
        actions.push(NegotiationAction::SendEnvelope(
            SignalingEnvelope::Candidate {
                candidate: self.local_candidate(),
                sender_id: self.local_peer_id.clone(),
                receiver_id: sender_id.clone(),
            },
        ));
        actions
    }

    fn handle_answer(
        &mut self,
        sender_id: &PeerId,
        answer: &SessionDescription,
    ) -> Vec<NegotiationAction> {
        let Some(session) = self.sessions.get_mut(sender_id) else {
            warn!(sender = %sender_id, "Answer for unknown negotiation, ignoring");
            return Vec::new();
        };
        Self::set_remote_description(session, sender_id, answer.clone())
    }

    fn handle_candidate(
        &mut self,
        sender_id: &PeerId,
        candidate: &CandidateInfo,
    ) -> Vec<NegotiationAction> {
        // A candidate can legitimately precede the offer; it opens the
        // session on the answering side.
        let session = self
            .sessions
            .entry(sender_id.clone())
            .or_insert_with(|| Session::new(Role::Answerer));

        if session.remote_description.is_none() {
            debug!(sender = %sender_id, "Queueing candidate until remote description is set");
            session.pending_candidates.push(candidate.clone());
            return Vec::new();
        }

        match Self::apply_candidate(session, sender_id, candidate.clone()) {
            Some(action) => vec![action],
            None => Vec::new(),
        }
    }
}

impl Negotiator for RendezvousNegotiator {
    /// For the rendezvous strategy "peer found" means: a `join` for
    /// the local group was observed, so this side is an existing
    /// member and must initiate the offer.
    fn on_peer_found(
        &mut self,
        peer_id: &PeerId,
        _data_addr: Option<&str>,
    ) -> Vec<NegotiationAction> {
        let Some(group) = self.group.clone() else {
            return Vec::new();
        };

        self.sessions
            .insert(peer_id.clone(), Session::new(Role::Offerer));

        vec![
            NegotiationAction::SendEnvelope(SignalingEnvelope::Offer {
                offer: self.local_description(DescriptionKind::Offer),
                sender_id: self.local_peer_id.clone(),
                receiver_id: peer_id.clone(),
                collection_id: group,
            }),
            NegotiationAction::SendEnvelope(SignalingEnvelope::Candidate {
                candidate: self.local_candidate(),
                sender_id: self.local_peer_id.clone(),
                receiver_id: peer_id.clone(),
            }),
        ]
    }

    fn on_envelope(&mut self, envelope: &SignalingEnvelope) -> Vec<NegotiationAction> {
        match envelope {
            SignalingEnvelope::Offer {
                offer,
                sender_id,
                receiver_id,
                collection_id,
            } if *receiver_id == self.local_peer_id => {
                self.handle_offer(sender_id, offer, collection_id)
            }
            SignalingEnvelope::Answer {
                answer,
                sender_id,
                receiver_id,
            } if *receiver_id == self.local_peer_id => self.handle_answer(sender_id, answer),
            SignalingEnvelope::Candidate {
                candidate,
                sender_id,
                receiver_id,
            } if *receiver_id == self.local_peer_id => {
                self.handle_candidate(sender_id, candidate)
            }
            _ => Vec::new(),
        }
    }

    fn on_channel_open(&mut self, peer_id: &PeerId) {
        self.sessions.remove(peer_id);
    }

    fn abandon(&mut self, peer_id: &PeerId) {
        self.sessions.remove(peer_id);
    }

    fn abandon_all(&mut self) -> Vec<PeerId> {
        self.sessions.drain().map(|(id, _)| id).collect()
    }

    fn expired(&mut self, timeout: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.started_at) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in &stale {
            self.sessions.remove(peer_id);
        }
        stale
    }
}
