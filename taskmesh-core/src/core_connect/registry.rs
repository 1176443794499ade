//! Connection registry: the single source of truth for "who can I
//! send to right now"
//!
//! Owned exclusively by the engine task; every mutation funnels
//! through that one task, so the map needs no interior locking. No
//! other component touches the peer map directly.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::peer_connection::PeerConnection;
use super::state::PeerState;
use crate::core_model::PeerId;

/// Mapping from peer id to its connection record
#[derive(Default)]
pub struct ConnectionRegistry {
    peers: HashMap<PeerId, PeerConnection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record for a peer
    ///
    /// Reconnecting a peer replaces its entry rather than creating a
    /// duplicate; the replaced connection's transport is released.
    pub fn upsert(&mut self, connection: PeerConnection) {
        let peer_id = connection.peer_id.clone();
        if let Some(mut previous) = self.peers.insert(peer_id.clone(), connection) {
            debug!(peer_id = %peer_id, "Replacing existing registry entry");
            previous.close();
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerConnection> {
        self.peers.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Evict a peer, releasing its transport handle
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerConnection> {
        let mut connection = self.peers.remove(peer_id)?;
        connection.close();
        Some(connection)
    }

    /// Peers currently in the given state
    pub fn peers_in_state(&self, state: PeerState) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|c| c.state == state)
            .map(|c| c.peer_id.clone())
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|c| c.state == PeerState::Connected)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Send bytes to every Connected peer
    ///
    /// Peers not yet connected are silently skipped, never queued.
    /// Broadcasting to zero connected peers is a no-op. A peer whose
    /// outbound queue is full has the message dropped instead of
    /// stalling the caller; a later broadcast carries the full state
    /// anyway.
    pub fn broadcast(&self, bytes: &[u8]) {
        use tokio::sync::mpsc::error::TrySendError;

        for connection in self.peers.values() {
            if connection.state != PeerState::Connected {
                continue;
            }
            if let Some(outbound) = &connection.outbound {
                match outbound.try_send(bytes.to_vec()) {
                    Ok(_) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(peer_id = %connection.peer_id, "Outbound queue full, dropping broadcast");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(peer_id = %connection.peer_id, "Broadcast send failed, channel gone");
                    }
                }
            }
        }
    }

    /// Close every connection and clear the map
    ///
    /// Idempotent; a second call is a no-op. No transport handle
    /// survives this.
    pub fn disconnect_all(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        info!(count = self.peers.len(), "Disconnecting all peers");
        for (_, mut connection) in self.peers.drain() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connected(peer: &str) -> (PeerConnection, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(8);
        let mut conn = PeerConnection::connecting(PeerId::from(peer));
        conn.attach_channel(tx, Vec::new());
        (conn, rx)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_only() {
        let mut registry = ConnectionRegistry::new();

        let (conn_a, mut rx_a) = connected("A");
        registry.upsert(conn_a);
        registry.upsert(PeerConnection::connecting(PeerId::from("B")));

        registry.broadcast(b"payload");

        assert_eq!(rx_a.recv().await.unwrap(), b"payload");
        assert_eq!(registry.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_with_zero_peers_is_noop() {
        let registry = ConnectionRegistry::new();
        // Must not panic or error.
        registry.broadcast(b"payload");
    }

    #[tokio::test]
    async fn test_broadcast_skips_stalled_peer_without_blocking() {
        let mut registry = ConnectionRegistry::new();

        // A peer whose single-slot queue nobody drains.
        let (tx_stalled, _rx_stalled) = mpsc::channel(1);
        let mut stalled = PeerConnection::connecting(PeerId::from("stalled"));
        stalled.attach_channel(tx_stalled, Vec::new());
        registry.upsert(stalled);

        let (healthy, mut rx) = connected("healthy");
        registry.upsert(healthy);

        // The stalled peer fills after the first send; the rest must
        // still go through to the healthy peer without waiting.
        for _ in 0..3 {
            registry.broadcast(b"snapshot");
        }

        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap(), b"snapshot");
        }
    }

    #[test]
    fn test_upsert_replaces_duplicate_peer() {
        let mut registry = ConnectionRegistry::new();

        registry.upsert(PeerConnection::connecting(PeerId::from("A")));
        let (conn, _rx) = connected("A");
        registry.upsert(conn);

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(&PeerId::from("A")).unwrap().state,
            PeerState::Connected
        );
    }

    #[test]
    fn test_remove_releases_transport() {
        let mut registry = ConnectionRegistry::new();
        let (conn, _rx) = connected("A");
        registry.upsert(conn);

        let removed = registry.remove(&PeerId::from("A")).unwrap();
        assert_eq!(removed.state, PeerState::Disconnected);
        assert!(removed.outbound.is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disconnect_all_idempotent() {
        let mut registry = ConnectionRegistry::new();
        let (conn_a, _rx_a) = connected("A");
        let (conn_b, _rx_b) = connected("B");
        registry.upsert(conn_a);
        registry.upsert(conn_b);

        registry.disconnect_all();
        assert!(registry.is_empty());

        // Second call is a no-op.
        registry.disconnect_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_no_disconnected_entries_persist() {
        let mut registry = ConnectionRegistry::new();
        let (conn, _rx) = connected("A");
        registry.upsert(conn);

        registry.remove(&PeerId::from("A"));
        assert!(registry.peers_in_state(PeerState::Disconnected).is_empty());
        assert!(!registry.contains(&PeerId::from("A")));
    }
}
