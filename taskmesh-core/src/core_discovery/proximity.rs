//! LAN proximity discovery over UDP broadcast
//!
//! Each device advertises a small JSON beacon `{peerId, name,
//! dataAddr}` on a well-known port and scans the same socket for other
//! devices' beacons. The topology is a symmetric mesh: every beacon
//! carries enough to connect directly, so any peer can connect to any
//! other. A peer whose beacons stop arriving past the liveness window
//! is reported lost.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DiscoveryEvent, DiscoveryProvider, DiscoveryUnavailable};
use crate::config::DiscoveryConfig;
use crate::core_model::PeerId;

use async_trait::async_trait;

/// One advertise datagram
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Beacon {
    peer_id: PeerId,
    name: String,
    data_addr: String,
}

/// UDP-broadcast discovery provider
pub struct ProximityDiscovery {
    config: DiscoveryConfig,
    /// Address of the local data-channel listener, carried in beacons
    data_addr: String,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    local_peer_id: Option<PeerId>,
    advertise_task: Option<JoinHandle<()>>,
    scan_task: Option<JoinHandle<()>>,
}

impl ProximityDiscovery {
    pub fn new(
        config: DiscoveryConfig,
        data_addr: String,
        event_tx: mpsc::Sender<DiscoveryEvent>,
    ) -> Self {
        Self {
            config,
            data_addr,
            event_tx,
            local_peer_id: None,
            advertise_task: None,
            scan_task: None,
        }
    }

    /// Peer id assigned at advertise time, once started
    pub fn local_peer_id(&self) -> Option<&PeerId> {
        self.local_peer_id.as_ref()
    }
}

#[async_trait]
impl DiscoveryProvider for ProximityDiscovery {
    async fn start(&mut self, local_display_name: &str) -> Result<PeerId, DiscoveryUnavailable> {
        // The discovery subsystem assigns the peer id at advertise
        // time for this strategy.
        let peer_id = PeerId::generate();

        let recv_socket = UdpSocket::bind(("0.0.0.0", self.config.beacon_port))
            .await
            .map_err(|e| DiscoveryUnavailable(format!("beacon bind failed: {}", e)))?;

        let send_socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| DiscoveryUnavailable(format!("beacon sender bind failed: {}", e)))?;
        send_socket
            .set_broadcast(true)
            .map_err(|e| DiscoveryUnavailable(format!("broadcast unavailable: {}", e)))?;

        let beacon = Beacon {
            peer_id: peer_id.clone(),
            name: local_display_name.to_string(),
            data_addr: self.data_addr.clone(),
        };
        let beacon_bytes = serde_json::to_vec(&beacon)
            .map_err(|e| DiscoveryUnavailable(format!("beacon encode failed: {}", e)))?;

        info!(peer_id = %peer_id, port = self.config.beacon_port, "Proximity discovery started");

        let interval = self.config.beacon_interval;
        let broadcast_addr = ("255.255.255.255", self.config.beacon_port);
        let advertise_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = send_socket.send_to(&beacon_bytes, broadcast_addr).await {
                    warn!(error = %e, "Beacon send failed");
                }
            }
        });

        let event_tx = self.event_tx.clone();
        let own_id = peer_id.clone();
        let liveness = self.config.peer_liveness_timeout;
        let sweep_interval = self.config.beacon_interval;
        let scan_task = tokio::spawn(async move {
            let socket = Arc::new(recv_socket);
            let mut last_seen: HashMap<PeerId, Instant> = HashMap::new();
            let mut sweep = tokio::time::interval(sweep_interval);
            let mut buf = vec![0u8; 2048];

            loop {
                tokio::select! {
                    recv = socket.recv_from(&mut buf) => {
                        let (len, _from) = match recv {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "Beacon receive failed");
                                continue;
                            }
                        };
                        let beacon: Beacon = match serde_json::from_slice(&buf[..len]) {
                            Ok(beacon) => beacon,
                            Err(_) => continue, // not ours
                        };
                        if beacon.peer_id == own_id {
                            continue;
                        }
                        let is_new = last_seen
                            .insert(beacon.peer_id.clone(), Instant::now())
                            .is_none();
                        if is_new {
                            debug!(peer_id = %beacon.peer_id, name = %beacon.name, "Peer found");
                            let _ = event_tx
                                .send(DiscoveryEvent::PeerFound {
                                    peer_id: beacon.peer_id,
                                    name: beacon.name,
                                    data_addr: Some(beacon.data_addr),
                                })
                                .await;
                        }
                    }
                    _ = sweep.tick() => {
                        let now = Instant::now();
                        let stale: Vec<PeerId> = last_seen
                            .iter()
                            .filter(|(_, seen)| now.duration_since(**seen) > liveness)
                            .map(|(id, _)| id.clone())
                            .collect();
                        for peer_id in stale {
                            last_seen.remove(&peer_id);
                            debug!(peer_id = %peer_id, "Peer lost");
                            let _ = event_tx
                                .send(DiscoveryEvent::PeerLost { peer_id })
                                .await;
                        }
                    }
                }
            }
        });

        self.advertise_task = Some(advertise_task);
        self.scan_task = Some(scan_task);
        self.local_peer_id = Some(peer_id.clone());
        Ok(peer_id)
    }

    async fn stop(&mut self) {
        if let Some(task) = self.advertise_task.take() {
            task.abort();
        }
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        if self.local_peer_id.take().is_some() {
            info!("Proximity discovery stopped");
        }
    }
}

impl Drop for ProximityDiscovery {
    fn drop(&mut self) {
        if let Some(task) = self.advertise_task.take() {
            task.abort();
        }
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }
}
