//! Synchronization engine
//!
//! One task owns everything mutable: the connection registry, the tree
//! replica, the negotiator, and the relay link. Discovery, relay, and
//! transport events funnel into its loop over channels, commands
//! arrive the same way, and all side effects leave as spawned dials or
//! envelope sends. Single writer, no locks.

use std::future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core_connect::{
    peer_connection::spawn_dial, ConnectionRegistry, DataListener, NegotiationAction, Negotiator,
    PeerConnection, PeerState, ProximityNegotiator, RendezvousNegotiator, TransportEvent,
};
use crate::core_discovery::{
    DiscoveryEvent, DiscoveryProvider, ProximityDiscovery, RendezvousDiscovery,
};
use crate::core_model::{GroupId, PeerId, TaskTree};
use crate::core_signal::{RelayClient, RelayEvent, SignalingEnvelope};

use super::errors::{SyncError, SyncResult};
use super::replication::Replicator;

/// How the engine finds peers and establishes channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// LAN beacons plus eager dialing; no relay involved
    Proximity,
    /// Group membership through a rendezvous relay
    Rendezvous,
}

/// Requests from the application into the engine task
enum EngineCommand {
    NotifyLocalMutation(TaskTree),
    CreateGroup {
        resp: oneshot::Sender<SyncResult<GroupId>>,
    },
    JoinGroup {
        group: GroupId,
        resp: oneshot::Sender<SyncResult<()>>,
    },
    CurrentGroup {
        resp: oneshot::Sender<Option<GroupId>>,
    },
    Snapshot {
        resp: oneshot::Sender<TaskTree>,
    },
    ConnectedPeers {
        resp: oneshot::Sender<Vec<PeerId>>,
    },
    SetSnapshotSink(mpsc::Sender<TaskTree>),
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    local_peer_id: PeerId,
}

impl EngineHandle {
    /// The device id this engine advertises
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// The local tree changed; replicate it to every connected peer
    pub async fn notify_local_mutation(&self, tree: TaskTree) -> SyncResult<()> {
        self.send(EngineCommand::NotifyLocalMutation(tree)).await
    }

    /// Create a new group and become its first member (rendezvous only)
    pub async fn create_group(&self) -> SyncResult<GroupId> {
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::CreateGroup { resp }).await?;
        rx.await
            .map_err(|_| SyncError::Engine("engine task stopped".to_string()))?
    }

    /// Join an existing group by id (rendezvous only)
    pub async fn join_group(&self, group: GroupId) -> SyncResult<()> {
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::JoinGroup { group, resp }).await?;
        rx.await
            .map_err(|_| SyncError::Engine("engine task stopped".to_string()))?
    }

    /// The group this device currently belongs to, if any
    pub async fn current_group_id(&self) -> SyncResult<Option<GroupId>> {
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::CurrentGroup { resp }).await?;
        rx.await
            .map_err(|_| SyncError::Engine("engine task stopped".to_string()))
    }

    /// The engine's current tree replica
    pub async fn snapshot(&self) -> SyncResult<TaskTree> {
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot { resp }).await?;
        rx.await
            .map_err(|_| SyncError::Engine("engine task stopped".to_string()))
    }

    /// Peers with an established data channel right now
    pub async fn connected_peers(&self) -> SyncResult<Vec<PeerId>> {
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::ConnectedPeers { resp }).await?;
        rx.await
            .map_err(|_| SyncError::Engine("engine task stopped".to_string()))
    }

    /// Stream of trees applied from remote snapshots
    ///
    /// Each well-formed incoming snapshot yields the tree it produced.
    /// Registering again replaces the previous subscriber.
    pub async fn remote_snapshots(&self) -> SyncResult<mpsc::Receiver<TaskTree>> {
        let (tx, rx) = mpsc::channel(16);
        self.send(EngineCommand::SetSnapshotSink(tx)).await?;
        Ok(rx)
    }

    /// Stop discovery, close the relay link, disconnect every peer,
    /// and end the engine task
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (resp, rx) = oneshot::channel();
        self.send(EngineCommand::Shutdown { resp }).await?;
        rx.await
            .map_err(|_| SyncError::Engine("engine task stopped".to_string()))
    }

    async fn send(&self, command: EngineCommand) -> SyncResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::Engine("engine task stopped".to_string()))
    }
}

/// Strategy-specific discovery and negotiation state
enum StrategyState {
    Proximity {
        discovery: ProximityDiscovery,
        negotiator: ProximityNegotiator,
    },
    Rendezvous {
        discovery: RendezvousDiscovery,
        negotiator: RendezvousNegotiator,
    },
}

impl StrategyState {
    fn negotiator_mut(&mut self) -> &mut dyn Negotiator {
        match self {
            StrategyState::Proximity { negotiator, .. } => negotiator,
            StrategyState::Rendezvous { negotiator, .. } => negotiator,
        }
    }

    fn group(&self) -> Option<GroupId> {
        match self {
            StrategyState::Proximity { .. } => None,
            StrategyState::Rendezvous { negotiator, .. } => negotiator.group().cloned(),
        }
    }

    async fn stop(&mut self) {
        match self {
            StrategyState::Proximity { discovery, .. } => discovery.stop().await,
            StrategyState::Rendezvous { discovery, .. } => discovery.stop().await,
        }
    }
}

/// The engine task's state
pub struct SyncEngine {
    config: Config,
    local_peer_id: PeerId,
    strategy: StrategyState,
    registry: ConnectionRegistry,
    replicator: Replicator,
    listener: DataListener,
    relay: Option<RelayClient>,
    relay_event_tx: mpsc::Sender<RelayEvent>,
    transport_tx: mpsc::Sender<TransportEvent>,
    snapshot_sink: Option<mpsc::Sender<TaskTree>>,
    reconnect_at: Option<Instant>,
    reconnect_backoff: Duration,
}

impl SyncEngine {
    /// Bring the engine up and return its handle
    ///
    /// A discovery or relay failure at startup is not fatal: the engine
    /// comes up with zero peers and, for the rendezvous strategy with
    /// reconnect enabled, keeps trying the relay in the background.
    pub async fn start(
        config: Config,
        strategy: SyncStrategy,
        device_name: &str,
        initial_tree: TaskTree,
    ) -> SyncResult<EngineHandle> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(32);
        let (discovery_tx, discovery_rx) = mpsc::channel(64);
        let (relay_event_tx, relay_rx) = mpsc::channel(64);
        let (transport_tx, transport_rx) = mpsc::channel(64);

        let queue_depth = config.engine.outbound_queue_depth;
        let listener = DataListener::bind(
            &config.engine.data_bind_address,
            transport_tx.clone(),
            queue_depth,
        )
        .await
        .map_err(|e| SyncError::Engine(format!("data listener bind failed: {}", e)))?;
        let listen_addr = listener.local_addr().to_string();

        let mut reconnect_at = None;
        let (local_peer_id, strategy_state, relay) = match strategy {
            SyncStrategy::Proximity => {
                let mut discovery = ProximityDiscovery::new(
                    config.discovery.clone(),
                    listen_addr,
                    discovery_tx,
                );
                let local_peer_id = match discovery.start(device_name).await {
                    Ok(peer_id) => peer_id,
                    Err(e) => {
                        // Degraded mode: no radio means no peers, but
                        // local operation continues.
                        warn!(error = %e, "Discovery unavailable, running without peers");
                        PeerId::generate()
                    }
                };
                let strategy_state = StrategyState::Proximity {
                    discovery,
                    negotiator: ProximityNegotiator::new(),
                };
                (local_peer_id, strategy_state, None)
            }
            SyncStrategy::Rendezvous => {
                let mut discovery = RendezvousDiscovery::new(discovery_tx);
                let local_peer_id = discovery.start(device_name).await?;
                let negotiator =
                    RendezvousNegotiator::new(local_peer_id.clone(), listen_addr);
                let relay = match RelayClient::connect(
                    &config.relay.address,
                    local_peer_id.clone(),
                    relay_event_tx.clone(),
                )
                .await
                {
                    Ok(client) => Some(client),
                    Err(e) => {
                        warn!(error = %e, "Relay unreachable at startup");
                        if config.relay.reconnect {
                            reconnect_at =
                                Some(Instant::now() + config.relay.reconnect_backoff);
                        }
                        None
                    }
                };
                let strategy_state = StrategyState::Rendezvous {
                    discovery,
                    negotiator,
                };
                (local_peer_id, strategy_state, relay)
            }
        };

        info!(peer_id = %local_peer_id, ?strategy, "Engine started");

        let engine = SyncEngine {
            reconnect_backoff: config.relay.reconnect_backoff,
            config,
            local_peer_id: local_peer_id.clone(),
            strategy: strategy_state,
            registry: ConnectionRegistry::new(),
            replicator: Replicator::new(initial_tree),
            listener,
            relay,
            relay_event_tx,
            transport_tx,
            snapshot_sink: None,
            reconnect_at,
        };

        tokio::spawn(engine.run(command_rx, discovery_rx, relay_rx, transport_rx));

        Ok(EngineHandle {
            command_tx,
            local_peer_id,
        })
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<EngineCommand>,
        mut discovery_rx: mpsc::Receiver<DiscoveryEvent>,
        mut relay_rx: mpsc::Receiver<RelayEvent>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let reconnect_deadline = self.reconnect_at;
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown { resp }) => {
                            self.teardown().await;
                            let _ = resp.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            // Every handle is gone; nothing can reach
                            // the engine again.
                            self.teardown().await;
                            break;
                        }
                    }
                }
                Some(event) = discovery_rx.recv() => {
                    self.handle_discovery_event(event).await;
                }
                Some(event) = relay_rx.recv() => {
                    self.handle_relay_event(event).await;
                }
                Some(event) = transport_rx.recv() => {
                    self.handle_transport_event(event).await;
                }
                _ = sweep.tick() => {
                    self.sweep_expired();
                }
                _ = async {
                    match reconnect_deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => future::pending().await,
                    }
                } => {
                    self.try_reconnect().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::NotifyLocalMutation(tree) => {
                let snapshot = self.replicator.local_mutation(tree);
                self.registry.broadcast(snapshot.as_bytes());
            }
            EngineCommand::CreateGroup { resp } => {
                let _ = resp.send(self.create_group());
            }
            EngineCommand::JoinGroup { group, resp } => {
                let _ = resp.send(self.join_group(group).await);
            }
            EngineCommand::CurrentGroup { resp } => {
                let _ = resp.send(self.strategy.group());
            }
            EngineCommand::Snapshot { resp } => {
                let _ = resp.send(self.replicator.tree().clone());
            }
            EngineCommand::ConnectedPeers { resp } => {
                let _ = resp.send(self.registry.peers_in_state(PeerState::Connected));
            }
            EngineCommand::SetSnapshotSink(tx) => {
                self.snapshot_sink = Some(tx);
            }
            EngineCommand::Shutdown { .. } => unreachable!("handled in the loop"),
        }
    }

    fn create_group(&mut self) -> SyncResult<GroupId> {
        let StrategyState::Rendezvous {
            discovery,
            negotiator,
        } = &mut self.strategy
        else {
            return Err(SyncError::WrongStrategy("create_group".to_string()));
        };

        // The creator is the group's only member until someone joins;
        // no envelope goes out for creation itself.
        let group = GroupId::generate();
        self.registry.disconnect_all();
        negotiator.abandon_all();
        negotiator.set_group(Some(group.clone()));
        discovery.set_group(Some(group.clone()));
        info!(group = %group, "Group created");
        Ok(group)
    }

    async fn join_group(&mut self, group: GroupId) -> SyncResult<()> {
        let StrategyState::Rendezvous { .. } = &self.strategy else {
            return Err(SyncError::WrongStrategy("join_group".to_string()));
        };
        let Some(relay) = &self.relay else {
            return Err(SyncError::SignalingUnavailable(
                "relay connection is down".to_string(),
            ));
        };

        relay
            .send(SignalingEnvelope::Join {
                collection_id: group.clone(),
                sender_id: self.local_peer_id.clone(),
            })
            .await
            .map_err(|e| SyncError::SignalingUnavailable(e.to_string()))?;

        // Switching groups drops the old group's peers entirely.
        if let StrategyState::Rendezvous {
            discovery,
            negotiator,
        } = &mut self.strategy
        {
            if negotiator.group() != Some(&group) {
                self.registry.disconnect_all();
                negotiator.abandon_all();
            }
            negotiator.set_group(Some(group.clone()));
            discovery.set_group(Some(group.clone()));
        }
        info!(group = %group, "Joined group");
        Ok(())
    }

    async fn handle_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::PeerFound {
                peer_id,
                name,
                data_addr,
            } => {
                if peer_id == self.local_peer_id || self.registry.contains(&peer_id) {
                    return;
                }
                info!(peer_id = %peer_id, name = %name, "Peer found");

                // When both sides see each other at once, only one may
                // dial or two channels come up for the same pair. The
                // lexically smaller id dials; the other waits for the
                // inbound connect.
                if matches!(self.strategy, StrategyState::Proximity { .. })
                    && self.local_peer_id >= peer_id
                {
                    debug!(peer_id = %peer_id, "Waiting for peer to dial us");
                    return;
                }

                let actions = self
                    .strategy
                    .negotiator_mut()
                    .on_peer_found(&peer_id, data_addr.as_deref());
                if !actions.is_empty() {
                    self.registry
                        .upsert(PeerConnection::connecting(peer_id.clone()));
                    self.execute(actions).await;
                }
            }
            DiscoveryEvent::PeerLost { peer_id } => {
                // A vanished peer only matters mid-negotiation; an
                // established channel reports its own close.
                if self
                    .registry
                    .get(&peer_id)
                    .map(|c| c.state == PeerState::Connecting)
                    .unwrap_or(false)
                {
                    info!(peer_id = %peer_id, "Peer lost during negotiation");
                    self.strategy.negotiator_mut().abandon(&peer_id);
                    self.registry.remove(&peer_id);
                }
            }
        }
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Envelope(envelope) => {
                if let SignalingEnvelope::Join {
                    collection_id,
                    sender_id,
                } = &envelope
                {
                    if let StrategyState::Rendezvous { discovery, .. } = &self.strategy {
                        discovery.observe_join(collection_id, sender_id);
                    }
                    return;
                }

                // An offer or early candidate is first contact from the
                // joiner's side; give it a registry entry.
                if let (Some(receiver), Some(sender)) = (envelope.receiver(), envelope.sender()) {
                    let starts_session = matches!(
                        envelope,
                        SignalingEnvelope::Offer { .. } | SignalingEnvelope::Candidate { .. }
                    );
                    if starts_session
                        && *receiver == self.local_peer_id
                        && !self.registry.contains(sender)
                    {
                        self.registry
                            .upsert(PeerConnection::connecting(sender.clone()));
                    }
                }

                let actions = self.strategy.negotiator_mut().on_envelope(&envelope);
                self.execute(actions).await;
            }
            RelayEvent::Disconnected => {
                warn!("Relay connection lost");
                self.relay = None;
                for peer_id in self.strategy.negotiator_mut().abandon_all() {
                    warn!(peer_id = %peer_id, "Negotiation abandoned, relay gone");
                    self.registry.remove(&peer_id);
                }
                if self.config.relay.reconnect {
                    self.reconnect_backoff = self.config.relay.reconnect_backoff;
                    self.reconnect_at = Some(Instant::now() + self.reconnect_backoff);
                }
            }
        }
    }

    async fn try_reconnect(&mut self) {
        self.reconnect_at = None;
        if !matches!(self.strategy, StrategyState::Rendezvous { .. }) || self.relay.is_some() {
            return;
        }

        match RelayClient::connect(
            &self.config.relay.address,
            self.local_peer_id.clone(),
            self.relay_event_tx.clone(),
        )
        .await
        {
            Ok(client) => {
                info!(addr = %self.config.relay.address, "Relay reconnected");
                // Re-announce membership so peers that joined during
                // the outage can find us.
                if let Some(group) = self.strategy.group() {
                    if let Err(e) = client
                        .send(SignalingEnvelope::Join {
                            collection_id: group,
                            sender_id: self.local_peer_id.clone(),
                        })
                        .await
                    {
                        warn!(error = %e, "Re-announcing group membership failed");
                    }
                }
                self.relay = Some(client);
                self.reconnect_backoff = self.config.relay.reconnect_backoff;
            }
            Err(e) => {
                self.reconnect_backoff = (self.reconnect_backoff * 2)
                    .min(self.config.relay.reconnect_backoff_cap);
                debug!(error = %e, backoff = ?self.reconnect_backoff, "Relay reconnect failed");
                self.reconnect_at = Some(Instant::now() + self.reconnect_backoff);
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened {
                peer_id,
                outbound,
                tasks,
            } => {
                self.strategy.negotiator_mut().on_channel_open(&peer_id);
                // upsert releases any previous transport for this peer.
                let mut connection = PeerConnection::connecting(peer_id.clone());
                connection.attach_channel(outbound, tasks);
                self.registry.upsert(connection);
                info!(peer_id = %peer_id, connected = self.registry.connected_count(), "Peer connected");
            }
            TransportEvent::Data { peer_id, bytes } => {
                match self.replicator.apply_remote(&bytes) {
                    Ok(tree) => {
                        debug!(peer_id = %peer_id, tasks = tree.tasks.len(), "Remote snapshot applied");
                        if let Some(sink) = &self.snapshot_sink {
                            if sink.try_send(tree.clone()).is_err() {
                                debug!("Snapshot subscriber not keeping up");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer_id = %peer_id, error = %e, "Rejected snapshot from peer");
                    }
                }
            }
            TransportEvent::Closed { peer_id } => {
                self.strategy.negotiator_mut().abandon(&peer_id);
                if self.registry.remove(&peer_id).is_some() {
                    info!(peer_id = %peer_id, "Peer disconnected");
                }
            }
        }
    }

    fn sweep_expired(&mut self) {
        let timeout = self.config.engine.negotiation_timeout;
        for peer_id in self.strategy.negotiator_mut().expired(timeout) {
            warn!(peer_id = %peer_id, "Negotiation timed out");
            self.registry.remove(&peer_id);
        }
    }

    async fn execute(&mut self, actions: Vec<NegotiationAction>) {
        for action in actions {
            match action {
                NegotiationAction::SendEnvelope(envelope) => {
                    let Some(relay) = &self.relay else {
                        warn!("Dropping envelope, relay connection is down");
                        continue;
                    };
                    if let Err(e) = relay.send(envelope).await {
                        warn!(error = %e, "Envelope send failed");
                    }
                }
                NegotiationAction::Dial { peer_id, addr } => {
                    debug!(peer_id = %peer_id, addr = %addr, "Dialing peer");
                    spawn_dial(
                        addr,
                        self.local_peer_id.clone(),
                        peer_id,
                        self.transport_tx.clone(),
                        self.config.engine.outbound_queue_depth,
                    );
                }
            }
        }
    }

    /// Orderly teardown; each step proceeds even if the previous
    /// failed
    async fn teardown(&mut self) {
        self.strategy.stop().await;
        if let Some(relay) = self.relay.take() {
            relay.close();
        }
        self.listener.shutdown();
        self.registry.disconnect_all();
        info!(peer_id = %self.local_peer_id, "Engine stopped");
    }
}
