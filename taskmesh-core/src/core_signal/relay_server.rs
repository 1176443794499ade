//! Rendezvous relay service
//!
//! A small forwarding hub: devices register a peer id, `join`
//! announcements fan out to every other registered device (devices
//! filter by their own collection id), and targeted envelopes
//! (offer/answer/candidate) are forwarded to `receiverId` only. The
//! relay keeps no state about collections and never inspects payloads
//! beyond the routing fields.
//!
//! The CLI exposes this as `taskmesh relay`; the integration tests run
//! it in-process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::envelope::SignalingEnvelope;
use super::framing::{read_frame, write_frame};
use crate::core_model::PeerId;

type PeerMap = Arc<Mutex<HashMap<PeerId, mpsc::Sender<SignalingEnvelope>>>>;

/// Handle to a running relay service
pub struct RelayServer {
    local_addr: SocketAddr,
    peers: PeerMap,
    accept_task: JoinHandle<()>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RelayServer {
    /// Bind the relay and start accepting connections
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Relay listening");

        let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
        let conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_peers = peers.clone();
        let accept_conn_tasks = conn_tasks.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "Relay connection accepted");
                        let peers = accept_peers.clone();
                        let task = tokio::spawn(handle_connection(stream, peers));
                        let mut tasks = accept_conn_tasks.lock().await;
                        // Reap handles of connections that already hung
                        // up, so the list tracks live connections only.
                        tasks.retain(|t| !t.is_finished());
                        tasks.push(task);
                    }
                    Err(e) => {
                        warn!(error = %e, "Relay accept failed");
                    }
                }
            }
        });

        Ok(RelayServer {
            local_addr,
            peers,
            accept_task,
            conn_tasks,
        })
    }

    /// Address the relay is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Currently registered peer ids, for inspection in tests
    pub async fn registered_peers(&self) -> Vec<PeerId> {
        self.peers.lock().await.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) async fn connection_task_count(&self) -> usize {
        self.conn_tasks.lock().await.len()
    }

    /// Stop accepting and drop every connection
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let conn_tasks = self.conn_tasks.clone();
        let peers = self.peers.clone();
        tokio::spawn(async move {
            for task in conn_tasks.lock().await.drain(..) {
                task.abort();
            }
            peers.lock().await.clear();
        });
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        // No await in drop; an uncontended try_lock is enough here.
        if let Ok(mut tasks) = self.conn_tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peers: PeerMap) {
    let (mut read_half, mut write_half) = stream.into_split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalingEnvelope>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let bytes = match serde_json::to_vec(&envelope) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            if write_frame(&mut write_half, &bytes).await.is_err() {
                break;
            }
        }
    });

    let mut registered: Option<PeerId> = None;

    loop {
        let bytes = match read_frame(&mut read_half).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Relay connection read failed");
                break;
            }
        };

        let envelope: SignalingEnvelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed envelope");
                continue;
            }
        };

        match &envelope {
            SignalingEnvelope::Register { peer_id } => {
                info!(peer_id = %peer_id, "Peer registered");
                // Re-registration replaces any stale entry.
                peers
                    .lock()
                    .await
                    .insert(peer_id.clone(), outbound_tx.clone());
                registered = Some(peer_id.clone());
            }
            SignalingEnvelope::Join { sender_id, .. } => {
                // Fan out to everyone else; receivers filter by their
                // own collection id.
                let snapshot: Vec<_> = peers
                    .lock()
                    .await
                    .iter()
                    .filter(|(id, _)| *id != sender_id)
                    .map(|(_, tx)| tx.clone())
                    .collect();
                for tx in snapshot {
                    let _ = tx.send(envelope.clone()).await;
                }
            }
            _ => {
                if let Some(receiver) = envelope.receiver() {
                    let target = peers.lock().await.get(receiver).cloned();
                    match target {
                        Some(tx) => {
                            let _ = tx.send(envelope.clone()).await;
                        }
                        None => {
                            debug!(receiver = %receiver, "Dropping envelope for unknown peer");
                        }
                    }
                }
            }
        }
    }

    if let Some(peer_id) = registered {
        info!(peer_id = %peer_id, "Peer unregistered");
        peers.lock().await.remove(&peer_id);
    }
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_model::GroupId;
    use crate::core_signal::relay_client::{RelayClient, RelayEvent};
    use tokio::time::{timeout, Duration};

    async fn next_envelope(rx: &mut mpsc::Receiver<RelayEvent>) -> SignalingEnvelope {
        loop {
            let event = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out")
                .expect("event channel closed");
            if let RelayEvent::Envelope(envelope) = event {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_join_fans_out_to_other_peers() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, _b_rx) = mpsc::channel(16);
        let _a = RelayClient::connect(&addr, PeerId::from("A"), a_tx)
            .await
            .unwrap();
        let b = RelayClient::connect(&addr, PeerId::from("B"), b_tx)
            .await
            .unwrap();

        // Give registrations a moment to land.
        timeout(Duration::from_secs(1), async {
            while server.registered_peers().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        b.send(SignalingEnvelope::Join {
            collection_id: GroupId::from("G-1"),
            sender_id: PeerId::from("B"),
        })
        .await
        .unwrap();

        let envelope = next_envelope(&mut a_rx).await;
        assert_eq!(
            envelope,
            SignalingEnvelope::Join {
                collection_id: GroupId::from("G-1"),
                sender_id: PeerId::from("B"),
            }
        );
    }

    #[tokio::test]
    async fn test_targeted_envelope_reaches_receiver_only() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        let (a_tx, mut a_rx) = mpsc::channel(16);
        let (b_tx, mut b_rx) = mpsc::channel(16);
        let a = RelayClient::connect(&addr, PeerId::from("A"), a_tx)
            .await
            .unwrap();
        let _b = RelayClient::connect(&addr, PeerId::from("B"), b_tx)
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while server.registered_peers().await.len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let candidate = SignalingEnvelope::Candidate {
            candidate: super::super::envelope::CandidateInfo {
                address: "127.0.0.1:4001".to_string(),
            },
            sender_id: PeerId::from("A"),
            receiver_id: PeerId::from("B"),
        };
        a.send(candidate.clone()).await.unwrap();

        let envelope = next_envelope(&mut b_rx).await;
        assert_eq!(envelope, candidate);

        // A must not hear its own candidate back.
        assert!(
            timeout(Duration::from_millis(200), a_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_envelope_for_unknown_peer_is_dropped() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        let (a_tx, _a_rx) = mpsc::channel(16);
        let a = RelayClient::connect(&addr, PeerId::from("A"), a_tx)
            .await
            .unwrap();

        // No peer "Z" exists; the send itself still succeeds.
        a.send(SignalingEnvelope::Answer {
            answer: super::super::envelope::SessionDescription {
                kind: super::super::envelope::DescriptionKind::Answer,
                listen_addr: "127.0.0.1:4002".to_string(),
            },
            sender_id: PeerId::from("A"),
            receiver_id: PeerId::from("Z"),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_finished_connection_tasks_are_reaped() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        // A burst of short-lived clients that register and hang up.
        for i in 0..5 {
            let (tx, _rx) = mpsc::channel(4);
            let client = RelayClient::connect(&addr, PeerId::from(format!("gone-{}", i)), tx)
                .await
                .unwrap();
            client.close();
        }

        timeout(Duration::from_secs(2), async {
            while !server.registered_peers().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Each new accept reaps finished handles; once the hung-up
        // connections have wound down, only live ones remain tracked.
        let mut live = Vec::new();
        let reaped = timeout(Duration::from_secs(2), async {
            loop {
                let (tx, rx) = mpsc::channel(4);
                let client =
                    RelayClient::connect(&addr, PeerId::from(format!("live-{}", live.len())), tx)
                        .await
                        .unwrap();
                live.push((client, rx));
                tokio::time::sleep(Duration::from_millis(20)).await;
                if server.connection_task_count().await <= live.len() {
                    break;
                }
            }
        })
        .await;
        assert!(reaped.is_ok(), "finished connection tasks were never reaped");
    }
}
