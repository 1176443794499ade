//! Rendezvous relay client
//!
//! One long-lived framed TCP connection to the relay service. On
//! connect it registers the local peer id; afterwards `send` is
//! fire-and-forget and a reader task demultiplexes inbound envelopes
//! onto the engine's event stream.
//!
//! The client never reconnects by itself. A drop is surfaced as
//! `RelayEvent::Disconnected` and the engine decides whether (and
//! when) to dial again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::envelope::SignalingEnvelope;
use super::framing::{read_frame, write_frame};
use crate::core_model::PeerId;

/// Errors from the relay link
#[derive(Debug, Clone, Error)]
pub enum SignalError {
    #[error("Failed to connect to relay at {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("Signaling unavailable: relay connection is down")]
    Unavailable,

    #[error("Failed to encode signaling envelope: {0}")]
    Encode(String),
}

/// Events delivered to the engine from the relay connection
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// An envelope arrived from the relay
    Envelope(SignalingEnvelope),
    /// The relay connection dropped; in-flight negotiations that
    /// depend on it must be abandoned
    Disconnected,
}

/// Handle to one relay connection
pub struct RelayClient {
    outbound_tx: mpsc::Sender<SignalingEnvelope>,
    connected: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl RelayClient {
    /// Connect to the relay, register the local peer, and start the
    /// reader/writer tasks
    pub async fn connect(
        addr: &str,
        local_peer_id: PeerId,
        event_tx: mpsc::Sender<RelayEvent>,
    ) -> Result<Self, SignalError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SignalError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let (mut read_half, mut write_half) = stream.into_split();

        let connected = Arc::new(AtomicBool::new(true));
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalingEnvelope>(64);

        let writer_connected = connected.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let bytes = match serde_json::to_vec(&envelope) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable signaling envelope");
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut write_half, &bytes).await {
                    warn!(error = %e, "Relay write failed");
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_connected = connected.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(bytes)) => match serde_json::from_slice::<SignalingEnvelope>(&bytes) {
                        Ok(envelope) => {
                            debug!(?envelope, "Relay envelope received");
                            if event_tx.send(RelayEvent::Envelope(envelope)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed relay envelope");
                        }
                    },
                    Ok(None) => {
                        debug!("Relay connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Relay read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        let client = RelayClient {
            outbound_tx,
            connected,
            reader_task,
            writer_task,
        };

        client
            .send(SignalingEnvelope::Register {
                peer_id: local_peer_id,
            })
            .await?;

        Ok(client)
    }

    /// Queue an envelope for the relay, fire-and-forget
    ///
    /// Fails with `SignalError::Unavailable` when the connection is
    /// down rather than dropping the envelope without trace.
    pub async fn send(&self, envelope: SignalingEnvelope) -> Result<(), SignalError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SignalError::Unavailable);
        }
        self.outbound_tx
            .send(envelope)
            .await
            .map_err(|_| SignalError::Unavailable)
    }

    /// Whether the relay connection is currently up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the connection and stop the background tasks
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_signal::relay_server::RelayServer;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_client_registers_on_connect() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        let (event_tx, _event_rx) = mpsc::channel(16);
        let client = RelayClient::connect(&addr, PeerId::from("A"), event_tx)
            .await
            .unwrap();

        // Registration lands asynchronously on the server.
        timeout(Duration::from_secs(1), async {
            while server.registered_peers().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server never saw the registration");

        assert_eq!(server.registered_peers().await, vec![PeerId::from("A")]);
        client.close();
        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_unavailable() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        let (event_tx, mut event_rx) = mpsc::channel(16);
        let client = RelayClient::connect(&addr, PeerId::from("A"), event_tx)
            .await
            .unwrap();

        server.shutdown();

        // The reader notices the drop and surfaces it.
        let event = timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .expect("timed out")
            .expect("event channel closed");
        assert!(matches!(event, RelayEvent::Disconnected));

        let result = client
            .send(SignalingEnvelope::Register {
                peer_id: PeerId::from("A"),
            })
            .await;
        assert!(matches!(result, Err(SignalError::Unavailable)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (event_tx, _event_rx) = mpsc::channel(16);
        // Port 1 is never listening.
        let result = RelayClient::connect("127.0.0.1:1", PeerId::from("A"), event_tx).await;
        assert!(matches!(result, Err(SignalError::ConnectFailed { .. })));
    }
}
