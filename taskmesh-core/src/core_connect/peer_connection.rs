//! Data channels and per-peer connection records
//!
//! A data channel is a framed TCP stream. The first frame after
//! connect is a hello carrying the dialer's peer id so the accepting
//! side can attribute the connection; everything after that is opaque
//! payload for the replication layer.

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::state::PeerState;
use crate::core_model::PeerId;
use crate::core_signal::framing::{read_frame, write_frame};

/// First frame on a freshly dialed data channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub peer_id: PeerId,
}

/// Transport notifications funneled into the engine loop
#[derive(Debug)]
pub enum TransportEvent {
    /// A data channel opened; `outbound` is the send handle for it
    /// and `tasks` are the channel's reader/writer tasks, handed to
    /// the owning `PeerConnection`
    Opened {
        peer_id: PeerId,
        outbound: mpsc::Sender<Vec<u8>>,
        tasks: Vec<JoinHandle<()>>,
    },
    /// Bytes arrived from a peer
    Data { peer_id: PeerId, bytes: Vec<u8> },
    /// The channel closed or failed
    Closed { peer_id: PeerId },
}

/// Per-peer record owned by the connection registry
///
/// The negotiator only constructs these; after handoff the registry is
/// the sole mutator.
pub struct PeerConnection {
    pub peer_id: PeerId,
    pub state: PeerState,
    /// Present once the data channel is established
    pub outbound: Option<mpsc::Sender<Vec<u8>>>,
    channel_tasks: Vec<JoinHandle<()>>,
}

impl PeerConnection {
    pub fn connecting(peer_id: PeerId) -> Self {
        PeerConnection {
            peer_id,
            state: PeerState::Connecting,
            outbound: None,
            channel_tasks: Vec::new(),
        }
    }

    /// Attach an established channel and move to Connected
    pub fn attach_channel(&mut self, outbound: mpsc::Sender<Vec<u8>>, tasks: Vec<JoinHandle<()>>) {
        debug_assert!(self.state.can_transition_to(PeerState::Connected));
        self.outbound = Some(outbound);
        self.channel_tasks = tasks;
        self.state = PeerState::Connected;
    }

    /// Drop the transport handle and stop its tasks
    ///
    /// Closing an already-Disconnected record is a no-op.
    pub fn close(&mut self) {
        if !self.state.can_transition_to(PeerState::Disconnected) {
            return;
        }
        self.outbound = None;
        for task in self.channel_tasks.drain(..) {
            task.abort();
        }
        self.state = PeerState::Disconnected;
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        for task in self.channel_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Split an accepted/dialed stream into reader and writer tasks
///
/// Returns the outbound handle plus the task handles so the owning
/// `PeerConnection` can abort them on close.
pub fn spawn_channel(
    stream: TcpStream,
    peer_id: PeerId,
    event_tx: mpsc::Sender<TransportEvent>,
    queue_depth: usize,
) -> (mpsc::Sender<Vec<u8>>, Vec<JoinHandle<()>>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(queue_depth);

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &bytes).await {
                warn!(error = %e, "Data channel write failed");
                break;
            }
        }
    });

    let reader_peer = peer_id.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(bytes)) => {
                    if event_tx
                        .send(TransportEvent::Data {
                            peer_id: reader_peer.clone(),
                            bytes,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(peer_id = %reader_peer, error = %e, "Data channel read failed");
                    break;
                }
            }
        }
        let _ = event_tx
            .send(TransportEvent::Closed {
                peer_id: reader_peer,
            })
            .await;
    });

    (outbound_tx, vec![writer_task, reader_task])
}

/// Dial a peer's data listener and send the hello frame
pub async fn dial_channel(
    addr: &str,
    local_peer_id: &PeerId,
) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    let hello = Hello {
        peer_id: local_peer_id.clone(),
    };
    let bytes = serde_json::to_vec(&hello)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_frame(&mut stream, &bytes).await?;
    Ok(stream)
}

/// Dial in the background and report the outcome as a transport event
///
/// Dialing is a suspension point; it must never block the engine loop,
/// so the connect happens on its own task and the result re-enters the
/// loop as `Opened` or `Closed`.
pub fn spawn_dial(
    addr: String,
    local_peer_id: PeerId,
    remote_peer_id: PeerId,
    event_tx: mpsc::Sender<TransportEvent>,
    queue_depth: usize,
) {
    tokio::spawn(async move {
        match dial_channel(&addr, &local_peer_id).await {
            Ok(stream) => {
                let (outbound, tasks) = spawn_channel(
                    stream,
                    remote_peer_id.clone(),
                    event_tx.clone(),
                    queue_depth,
                );
                let _ = event_tx
                    .send(TransportEvent::Opened {
                        peer_id: remote_peer_id,
                        outbound,
                        tasks,
                    })
                    .await;
            }
            Err(e) => {
                warn!(peer_id = %remote_peer_id, addr = %addr, error = %e, "Dial failed");
                let _ = event_tx
                    .send(TransportEvent::Closed {
                        peer_id: remote_peer_id,
                    })
                    .await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_dial_sends_hello() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let local = PeerId::from("dialer");
        let dial = tokio::spawn(async move { dial_channel(&addr, &local).await.unwrap() });

        let (mut accepted, _) = listener.accept().await.unwrap();
        let frame = read_frame(&mut accepted).await.unwrap().unwrap();
        let hello: Hello = serde_json::from_slice(&frame).unwrap();
        assert_eq!(hello.peer_id, PeerId::from("dialer"));

        dial.await.unwrap();
    }

    #[tokio::test]
    async fn test_channel_round_trip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let dial = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        let dialed = dial.await.unwrap();

        let (event_tx, mut event_rx) = mpsc::channel(16);
        let (to_peer, _tasks_a) =
            spawn_channel(dialed, PeerId::from("B"), mpsc::channel(16).0, 16);
        let (_to_us, _tasks_b) = spawn_channel(accepted, PeerId::from("A"), event_tx, 16);

        to_peer.send(b"snapshot".to_vec()).await.unwrap();

        let event = timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::Data { peer_id, bytes } => {
                assert_eq!(peer_id, PeerId::from("A"));
                assert_eq!(bytes, b"snapshot");
            }
            other => panic!("expected Data event, got {:?}", other),
        }

        // Dropping the sender closes the writer; the remote reader
        // must observe the close.
        drop(to_peer);
        drop(_tasks_a);
        let event = timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::Closed { .. }));
    }

    #[test]
    fn test_peer_connection_lifecycle() {
        let mut conn = PeerConnection::connecting(PeerId::from("A"));
        assert_eq!(conn.state, PeerState::Connecting);
        assert!(conn.outbound.is_none());

        let (tx, _rx) = mpsc::channel(1);
        conn.attach_channel(tx, Vec::new());
        assert_eq!(conn.state, PeerState::Connected);
        assert!(conn.outbound.is_some());

        conn.close();
        assert_eq!(conn.state, PeerState::Disconnected);
        assert!(conn.outbound.is_none());

        // Disconnected is terminal; a second close changes nothing.
        conn.close();
        assert_eq!(conn.state, PeerState::Disconnected);
    }
}
