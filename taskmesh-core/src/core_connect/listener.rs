//! Data-channel listener
//!
//! Accepts inbound data channels, reads the hello frame to learn who
//! dialed, and hands the established channel to the engine loop as a
//! transport event. Acceptance is automatic: inbound connections are
//! never held for user approval.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::peer_connection::{spawn_channel, Hello, TransportEvent};
use crate::core_signal::framing::read_frame;

/// How long an accepted connection may take to present its hello
const HELLO_DEADLINE: Duration = Duration::from_secs(5);

/// Listening socket for inbound data channels
pub struct DataListener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl DataListener {
    /// Bind and start accepting
    pub async fn bind(
        addr: &str,
        event_tx: mpsc::Sender<TransportEvent>,
        queue_depth: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Data listener bound");

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "Inbound data channel");
                        let event_tx = event_tx.clone();
                        tokio::spawn(accept_channel(stream, event_tx, queue_depth));
                    }
                    Err(e) => {
                        warn!(error = %e, "Data listener accept failed");
                    }
                }
            }
        });

        Ok(DataListener {
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for DataListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_channel(
    mut stream: TcpStream,
    event_tx: mpsc::Sender<TransportEvent>,
    queue_depth: usize,
) {
    let hello_frame = match tokio::time::timeout(HELLO_DEADLINE, read_frame(&mut stream)).await {
        Ok(Ok(Some(bytes))) => bytes,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            warn!(error = %e, "Failed reading hello frame");
            return;
        }
        Err(_) => {
            warn!("Inbound connection never sent hello");
            return;
        }
    };

    let hello: Hello = match serde_json::from_slice(&hello_frame) {
        Ok(hello) => hello,
        Err(e) => {
            warn!(error = %e, "Malformed hello frame");
            return;
        }
    };

    let peer_id = hello.peer_id;
    let (outbound, tasks) = spawn_channel(stream, peer_id.clone(), event_tx.clone(), queue_depth);
    let _ = event_tx
        .send(TransportEvent::Opened {
            peer_id,
            outbound,
            tasks,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_connect::peer_connection::dial_channel;
    use crate::core_model::PeerId;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_accept_attributes_peer_from_hello() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let listener = DataListener::bind("127.0.0.1:0", event_tx, 16)
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        let _stream = dial_channel(&addr, &PeerId::from("dialer")).await.unwrap();

        let event = timeout(Duration::from_secs(2), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::Opened { peer_id, .. } => {
                assert_eq!(peer_id, PeerId::from("dialer"));
            }
            other => panic!("expected Opened, got {:?}", other),
        }

        listener.shutdown();
    }

    #[tokio::test]
    async fn test_connection_without_hello_is_dropped() {
        let (event_tx, mut event_rx) = mpsc::channel(16);
        let listener = DataListener::bind("127.0.0.1:0", event_tx, 16)
            .await
            .unwrap();
        let addr = listener.local_addr().to_string();

        // Plain connect, no hello frame, then close.
        let stream = TcpStream::connect(&addr).await.unwrap();
        drop(stream);

        assert!(
            timeout(Duration::from_millis(300), event_rx.recv())
                .await
                .is_err(),
            "no event should be emitted for a helloless connection"
        );

        listener.shutdown();
    }
}
