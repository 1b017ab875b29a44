//! Overlay Engine - control surface
//!
//! Owns one instance of every subsystem, dispatches inbound mesh messages,
//! runs the periodic maintenance loops and exposes the calls external
//! collaborators use: status, resolve/connect, filter lists, identity
//! rotation and interference reports.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use oblivion_dht::{keys, DhtStore};
use oblivion_net::{
    is_relay_eligible, BootstrapSource, Envelope, HolePuncher, HttpBootstrap, InboundMessage,
    MeshRouter, MessageBody, NatClassifier, NatType, NetworkError, PeerCapabilities,
    PeerConnector, PeerDirectory, PeerEvent, PeerId, PeerInfo, PeerTransport, PingConnector,
    PunchOutcome, PunchTarget, ReachabilityProbe, RelayEvent, RelayManager, RelayNegotiator,
    RequestTracker, RouteOutcome, StrategyExecutor, StunProbe, TransportNegotiator,
    UdpMeshTransport, UdpPunchExecutor,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{BridgeDescriptor, BridgeManager, SessionCloseReason, TransportRegistry};
use crate::circuit::{CircuitManager, CircuitPurpose, CircuitStats, HopConnector, TcpHopConnector};
use crate::config::CoreConfig;
use crate::directory::{RelayDescriptor, RelayDirectory};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, InterferenceKind, OverlayEvent};
use crate::onion::{
    CacheStats, ConnectOptions, DescriptorFetcher, DhtDescriptorFetcher, OnionConnection,
    OnionResolution, OnionResolver, RendezvousHandshake, TcpRendezvous,
};

/// Bridges offered as circuit entry in bridge-only mode
const ENTRY_BRIDGES: usize = 8;

/// How long shutdown waits for a background task before aborting it
const TASK_GRACE: Duration = Duration::from_secs(2);

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Aggregate status for external collaborators
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: EngineState,
    pub peer_id: PeerId,
    pub nat_type: NatType,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub routes: usize,
    pub dht_entries: usize,
    pub relays_known: usize,
    pub circuits: CircuitStats,
    pub active_bridges: usize,
    pub bridge_sessions: usize,
    pub relay_sessions: usize,
    pub bridges_only: bool,
    pub onion_cache: CacheStats,
    pub interference_reports: u64,
    pub uptime: Duration,
}

/// How a peer ended up reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerLink {
    Direct { latency: Duration },
    Punched(PunchOutcome),
    Relayed { session_id: u64 },
}

/// Startup data supplied by whoever loads the node configuration
#[derive(Debug, Clone, Default)]
pub struct Bootstrap {
    pub bridges: Vec<BridgeDescriptor>,
    pub relays: Vec<RelayDescriptor>,
}

/// The pluggable pieces the engine is assembled from
pub struct Components {
    pub transport: Arc<dyn PeerTransport>,
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub bootstrap: Arc<dyn BootstrapSource>,
    /// `None` connects by ping/pong over the mesh transport
    pub connector: Option<Arc<dyn PeerConnector>>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub punch: Arc<dyn StrategyExecutor>,
    /// `None` relays through the mesh transport
    pub negotiator: Option<Arc<dyn RelayNegotiator>>,
    pub hops: Arc<dyn HopConnector>,
    pub transports: TransportRegistry,
    /// `None` reads descriptors from the DHT
    pub descriptors: Option<Arc<dyn DescriptorFetcher>>,
    pub rendezvous: Arc<dyn RendezvousHandshake>,
}

impl Components {
    /// Real network components: UDP mesh, HTTP bootstrap, STUN probing
    pub async fn udp(config: &CoreConfig, local_id: PeerId) -> CoreResult<Self> {
        let (transport, inbound) = UdpMeshTransport::bind(config.listen_addr).await?;
        let ephemeral = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        Ok(Self {
            transport,
            inbound,
            bootstrap: Arc::new(HttpBootstrap::new(config.discovery.bootstrap_timeout())?),
            connector: None,
            probe: Arc::new(StunProbe::new(config.nat.probe_timeout())),
            punch: Arc::new(UdpPunchExecutor::new(
                local_id,
                ephemeral,
                config.hole_punch.aggressive_port_spread,
            )),
            negotiator: None,
            hops: Arc::new(TcpHopConnector),
            transports: TransportRegistry::with_defaults(&config.bridge.enabled_transports),
            descriptors: None,
            rendezvous: Arc::new(TcpRendezvous),
        })
    }
}

/// The overlay engine
pub struct OverlayEngine {
    config: CoreConfig,
    state: RwLock<EngineState>,
    started_at: RwLock<Option<Instant>>,
    events: EventBus,
    transport: Arc<dyn PeerTransport>,
    /// Held here while the dispatch task is not running
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    directory: Arc<PeerDirectory>,
    /// Set when the default connector is in use; fed with pongs
    ping: Option<Arc<PingConnector>>,
    nat: NatClassifier,
    puncher: HolePuncher,
    dht: Arc<DhtStore>,
    router: Arc<MeshRouter>,
    relays: Arc<RelayManager>,
    relay_directory: Arc<RelayDirectory>,
    bootstrap_relays: Vec<RelayDescriptor>,
    circuits: Arc<CircuitManager>,
    bridges: Arc<BridgeManager>,
    onion: OnionResolver,
    filter_requests: RequestTracker<Vec<u8>>,
    /// Lowest latency seen to any peer; feeds relay eligibility
    best_latency: RwLock<Option<Duration>>,
    interference: Mutex<HashMap<InterferenceKind, u64>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OverlayEngine {
    /// Assemble the engine. Nothing touches the network until `initialize`.
    pub fn new(
        config: CoreConfig,
        local_id: PeerId,
        components: Components,
        bootstrap: Bootstrap,
    ) -> CoreResult<Arc<Self>> {
        config.validate().map_err(CoreError::ConfigError)?;

        let Components {
            transport,
            inbound,
            bootstrap: bootstrap_source,
            connector,
            probe,
            punch,
            negotiator,
            hops,
            transports,
            descriptors,
            rendezvous,
        } = components;

        let events = EventBus::default();
        let local = PeerInfo::new(local_id, transport.local_addr()).with_capabilities(PeerCapabilities {
            relay: false,
            dht: true,
            bridge: false,
            filter_cache: true,
        });

        let (ping, connector): (Option<Arc<PingConnector>>, Arc<dyn PeerConnector>) = match connector {
            Some(connector) => (None, connector),
            None => {
                let ping = Arc::new(PingConnector::new(
                    local_id,
                    transport.clone(),
                    config.discovery.connect_timeout(),
                ));
                let connector: Arc<dyn PeerConnector> = ping.clone();
                (Some(ping), connector)
            }
        };

        let directory = PeerDirectory::new(
            local,
            config.discovery.clone(),
            transport.clone(),
            connector,
            bootstrap_source,
        );
        let dht = Arc::new(DhtStore::new(
            local_id,
            config.dht.clone(),
            transport.clone(),
            directory.clone(),
        ));
        let router = Arc::new(MeshRouter::new(
            local_id,
            config.mesh.clone(),
            transport.clone(),
            directory.clone(),
        ));
        let negotiator =
            negotiator.unwrap_or_else(|| Arc::new(TransportNegotiator::new(transport.clone())));
        let relays = Arc::new(RelayManager::new(
            config.relay.clone(),
            directory.clone(),
            negotiator,
        ));

        let relay_directory = Arc::new(RelayDirectory::new());
        let circuits = Arc::new(CircuitManager::new(
            config.circuit.clone(),
            relay_directory.clone(),
            hops,
            events.clone(),
        ));
        let bridges = Arc::new(BridgeManager::new(
            config.bridge.clone(),
            transports,
            bootstrap.bridges,
            Some(dht.clone()),
            events.clone(),
        ));
        let descriptors =
            descriptors.unwrap_or_else(|| Arc::new(DhtDescriptorFetcher::new(dht.clone())));
        let onion = OnionResolver::new(
            config.onion.clone(),
            circuits.clone(),
            descriptors,
            rendezvous,
            events.clone(),
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            nat: NatClassifier::new(config.nat.clone(), probe),
            puncher: HolePuncher::new(config.hole_punch.clone(), punch),
            config,
            state: RwLock::new(EngineState::Stopped),
            started_at: RwLock::new(None),
            events,
            transport,
            inbound: Mutex::new(Some(inbound)),
            directory,
            ping,
            dht,
            router,
            relays,
            relay_directory,
            bootstrap_relays: bootstrap.relays,
            circuits,
            bridges,
            onion,
            filter_requests: RequestTracker::new(),
            best_latency: RwLock::new(None),
            interference: Mutex::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    pub async fn local_id(&self) -> PeerId {
        self.directory.local_id().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn dht(&self) -> &Arc<DhtStore> {
        &self.dht
    }

    pub fn circuits(&self) -> &Arc<CircuitManager> {
        &self.circuits
    }

    pub fn bridges(&self) -> &Arc<BridgeManager> {
        &self.bridges
    }

    /// Bring the engine up: classify NAT, discover peers, relays and
    /// bridges, build the circuit pool and start maintenance
    pub async fn initialize(self: &Arc<Self>) -> CoreResult<()> {
        {
            let mut state = self.state.write().await;
            if *state != EngineState::Stopped {
                debug!("Initialize ignored, engine is {:?}", *state);
                return Ok(());
            }
            *state = EngineState::Starting;
        }

        info!("Starting overlay engine as {}", self.local_id().await);
        self.shutdown.send_replace(false);
        *self.started_at.write().await = Some(Instant::now());

        self.spawn_dispatch().await;
        self.spawn_event_forwarders().await;

        let nat_type = self.reclassify_nat().await;
        info!("NAT type: {}", nat_type);

        match self.directory.discover().await {
            Ok(added) => debug!("Bootstrap added {} peers", added),
            Err(e) => warn!("Peer discovery failed: {}. Continuing with known peers", e),
        }

        let relays = self.refresh_relay_directory().await;
        let bridges = self.bridges.discover_bridges().await;
        info!("{} relays and {} bridges available", relays, bridges);

        if self.config.circuit.bridges_only {
            self.enable_bridges_only().await;
        }

        let built = self.fill_circuit_pool().await;
        info!("Built {} of {} initial circuits", built, self.config.circuit.min_circuits);

        self.spawn_maintenance().await;

        *self.state.write().await = EngineState::Running;
        info!("Overlay engine running");
        Ok(())
    }

    /// Stop maintenance, tear down circuits and sessions
    pub async fn shutdown(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                EngineState::Stopped => return Ok(()),
                EngineState::Running => *state = EngineState::Stopping,
                other => {
                    debug!("Shutdown ignored, engine is {:?}", other);
                    return Ok(());
                }
            }
        }

        info!("Stopping overlay engine...");
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if timeout(TASK_GRACE, task).await.is_err() {
                warn!("Background task did not stop in time, aborting");
                abort.abort();
            }
        }

        let circuits = self.circuits.destroy_all("shutdown").await;
        let sessions = self.bridges.close_all_sessions(SessionCloseReason::Requested).await;
        self.dht.cancel_queries().await;
        let waiting = self.filter_requests.cancel_all().await;
        if waiting > 0 {
            debug!("Cancelled {} filter list requests", waiting);
        }
        self.onion.clear().await;

        *self.started_at.write().await = None;
        *self.state.write().await = EngineState::Stopped;
        info!(
            "Overlay engine stopped ({} circuits, {} bridge sessions closed)",
            circuits, sessions
        );
        Ok(())
    }

    async fn ensure_running(&self) -> CoreResult<()> {
        match *self.state.read().await {
            EngineState::Running => Ok(()),
            _ => Err(CoreError::NotRunning),
        }
    }

    /// Aggregate status
    pub async fn status(&self) -> EngineStatus {
        let uptime = self
            .started_at
            .read()
            .await
            .map(|t| t.elapsed())
            .unwrap_or_default();

        EngineStatus {
            state: self.state().await,
            peer_id: self.local_id().await,
            nat_type: self.nat.nat_type().await,
            known_peers: self.directory.peer_count().await,
            connected_peers: self.directory.connected_count().await,
            routes: self.router.route_count().await,
            dht_entries: self.dht.entry_count().await,
            relays_known: self.relay_directory.len().await,
            circuits: self.circuits.stats().await,
            active_bridges: self.bridges.active_count().await,
            bridge_sessions: self.bridges.session_count().await,
            relay_sessions: self.relays.active_sessions().await,
            bridges_only: self.circuits.bridges_only().await,
            onion_cache: self.onion.cache_stats().await,
            interference_reports: self.interference.lock().await.values().sum(),
            uptime,
        }
    }

    /// Resolve an onion address
    pub async fn resolve(&self, address: &str) -> CoreResult<OnionResolution> {
        self.ensure_running().await?;
        self.onion.resolve(address).await
    }

    /// Open a connection to an onion service
    pub async fn connect(&self, address: &str, options: ConnectOptions) -> CoreResult<OnionConnection> {
        self.ensure_running().await?;
        self.onion.connect(address, options).await
    }

    /// Reach a peer directly, by hole punching, or through a relay
    pub async fn connect_to_peer(&self, peer_id: PeerId) -> CoreResult<PeerLink> {
        self.ensure_running().await?;
        let peer = self
            .directory
            .get(&peer_id)
            .await
            .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))?;

        match self.directory.connect_peer(peer_id).await {
            Ok(latency) => return Ok(PeerLink::Direct { latency }),
            Err(e) => debug!("Direct connection to {} failed: {}", peer_id, e),
        }

        let local = self.directory.local_info().await;
        let local_nat = self.nat.nat_type().await;
        let target = PunchTarget::new(peer.info.clone(), peer.info.candidates.clone());
        if target.candidates.is_empty() {
            debug!("{} shared no candidates, only direct punching is possible", peer_id);
        }
        match self.puncher.punch(&local, local_nat, &target).await {
            Ok(outcome) => return Ok(PeerLink::Punched(outcome)),
            Err(e) => info!("Hole punch to {} failed ({}), falling back to relay", peer_id, e),
        }

        let session_id = self.relays.establish_relay_connection(&local, &peer.info).await?;
        Ok(PeerLink::Relayed { session_id })
    }

    /// Send bytes over an established relay session
    pub async fn relay_data(&self, session_id: u64, data: &[u8]) -> CoreResult<()> {
        self.ensure_running().await?;
        self.relays.relay_data(session_id, data).await?;
        Ok(())
    }

    /// Route a payload to a peer across the mesh
    pub async fn send_to_peer(&self, destination: PeerId, payload: Vec<u8>) -> CoreResult<RouteOutcome> {
        self.ensure_running().await?;
        Ok(self.router.route(destination, payload).await?)
    }

    /// Fetch a filter list: DHT first, then peers caching filter lists
    pub async fn request_filter_list(&self, name: &str) -> CoreResult<Vec<u8>> {
        self.ensure_running().await?;

        if let Some(content) = self.dht.retrieve(&keys::filter_list(name)).await? {
            debug!("Filter list '{}' found in the DHT", name);
            return Ok(content);
        }

        let mut peers: Vec<PeerInfo> = self
            .directory
            .connected_peers()
            .await
            .into_iter()
            .filter(|p| p.capabilities.filter_cache)
            .collect();
        peers.truncate(self.config.dht.query_fanout);

        let (request_id, rx) = self.filter_requests.register().await;
        let request = Envelope::new(
            self.local_id().await,
            MessageBody::FilterRequest {
                request_id,
                name: name.to_string(),
            },
        );

        let mut asked = 0;
        for peer in &peers {
            match timeout(self.config.dht.send_timeout(), self.transport.send(peer.addr, &request)).await {
                Ok(Ok(())) => asked += 1,
                Ok(Err(e)) => debug!("Filter request to {} failed: {}", peer.peer_id, e),
                Err(_) => debug!("Filter request to {} timed out", peer.peer_id),
            }
        }
        if asked == 0 {
            self.filter_requests.cancel(request_id).await;
            return Err(CoreError::ServiceUnavailable(format!(
                "filter list '{}' not found",
                name
            )));
        }

        match timeout(self.config.dht.query_timeout(), rx).await {
            Ok(Ok(content)) => {
                info!("Filter list '{}' fetched from peers ({} bytes)", name, content.len());
                Ok(content)
            }
            Ok(Err(_)) => Err(CoreError::Cancelled),
            Err(_) => {
                self.filter_requests.cancel(request_id).await;
                Err(CoreError::DhtQueryTimeout(format!("filter list '{}'", name)))
            }
        }
    }

    /// Publish a filter list; returns how many peers received a replica
    pub async fn publish_filter_list(&self, name: &str, content: Vec<u8>, ttl: Duration) -> CoreResult<usize> {
        let (_, replicas) = self.dht.store(&keys::filter_list(name), content, ttl).await?;
        info!("Published filter list '{}' to {} peers", name, replicas);
        Ok(replicas)
    }

    /// Advertise relays in the DHT directory entry
    pub async fn publish_relays(&self, relays: &[RelayDescriptor], ttl: Duration) -> CoreResult<usize> {
        let value = serde_json::to_vec(relays)?;
        let (_, replicas) = self.dht.store(&keys::relay_directory(), value, ttl).await?;
        Ok(replicas)
    }

    /// Rotate to a fresh identity: every circuit is destroyed, onion state
    /// forgotten, and a minimal pool rebuilt
    pub async fn new_identity(&self) -> CoreResult<PeerId> {
        let peer_id = PeerId::from_public_key(&rand::random::<[u8; 32]>());
        info!("Rotating identity to {}", peer_id);

        let destroyed = self.circuits.destroy_all("new identity").await;
        self.onion.clear().await;

        let mut local = self.directory.local_info().await;
        local.peer_id = peer_id;
        self.directory.set_local_info(local).await;
        self.dht.set_local_id(peer_id).await;
        self.router.reset(peer_id).await;

        self.events.publish(OverlayEvent::IdentityRotated { peer_id });

        if self.state().await == EngineState::Running {
            let built = self.fill_circuit_pool().await;
            info!("New identity: {} circuits destroyed, {} built", destroyed, built);
        }
        Ok(peer_id)
    }

    /// Record interference seen by a collaborator. Relay blocking moves
    /// circuit entry to bridges; a blocked bridge counts as a failure.
    ///
    /// Returns true if circuit routing changed.
    pub async fn report_interference(&self, kind: InterferenceKind, target: &str) -> bool {
        warn!("Interference reported: {:?} on {}", kind, target);
        *self.interference.lock().await.entry(kind).or_insert(0) += 1;
        self.events.publish(OverlayEvent::InterferenceReported {
            kind,
            target: target.to_string(),
        });

        if kind.blocks_relays() {
            return self.enable_bridges_only().await;
        }
        if kind == InterferenceKind::BridgeBlocked && self.bridges.record_failure(target).await {
            if self.circuits.bridges_only().await {
                self.refresh_entry_bridges().await;
            }
            return true;
        }
        false
    }

    /// Switch circuit entry to bridges. False when no bridge is usable.
    async fn enable_bridges_only(&self) -> bool {
        let entries = self.bridges.entry_relays(ENTRY_BRIDGES).await;
        if entries.is_empty() {
            warn!("Bridge-only circuits requested but no bridge is available");
            return false;
        }

        let already = self.circuits.bridges_only().await;
        self.circuits.set_entry_guards(Some(entries)).await;
        if !already {
            let degraded = self.circuits.degrade_all().await;
            warn!("Switched to bridge-only circuits, {} circuits degraded", degraded);
            self.events.publish(OverlayEvent::BridgesOnly);
        }
        true
    }

    /// Re-rank entry bridges after health changes
    async fn refresh_entry_bridges(&self) {
        let entries = self.bridges.entry_relays(ENTRY_BRIDGES).await;
        if entries.is_empty() {
            warn!("Every entry bridge is gone; circuits cannot be built until bridges recover");
        }
        self.circuits.set_entry_guards(Some(entries)).await;
    }

    /// Merge bootstrap relays with the directory published in the DHT
    async fn refresh_relay_directory(&self) -> usize {
        self.relay_directory.update(self.bootstrap_relays.iter().cloned()).await;

        match self.dht.retrieve(&keys::relay_directory()).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<RelayDescriptor>>(&bytes) {
                Ok(published) => {
                    self.relay_directory.update(published).await;
                }
                Err(e) => warn!("Malformed relay directory in the DHT: {}", e),
            },
            Ok(None) => debug!("No relay directory published"),
            Err(e) => debug!("Relay directory lookup failed: {}", e),
        }
        self.relay_directory.len().await
    }

    /// Build general circuits up to the configured minimum
    async fn fill_circuit_pool(&self) -> usize {
        let ready = self.circuits.ready_count(CircuitPurpose::General).await;
        let missing = self.config.circuit.min_circuits.saturating_sub(ready);
        let mut built = 0;
        for _ in 0..missing {
            match self.circuits.create_circuit(CircuitPurpose::General, None).await {
                Ok(_) => built += 1,
                Err(e) => {
                    warn!("Failed to build circuit: {}. Continuing anyway...", e);
                    break;
                }
            }
        }
        built
    }

    /// Classify NAT and update what we advertise
    async fn reclassify_nat(&self) -> NatType {
        let classification = self.nat.classify().await;
        self.update_advertisement(classification.nat_type).await;
        if classification.changed() {
            self.events.publish(OverlayEvent::NatTypeChanged {
                previous: classification.previous,
                current: classification.nat_type,
            });
        }
        classification.nat_type
    }

    async fn update_advertisement(&self, nat_type: NatType) {
        let latency = *self.best_latency.read().await;
        let mut local = self.directory.local_info().await;
        let relay = is_relay_eligible(nat_type, latency, &self.config.relay);
        if relay != local.capabilities.relay {
            info!("Relay eligibility: {}", relay);
        }
        local.nat_type = nat_type;
        local.capabilities.relay = relay;
        local.candidates = self.nat.shared_candidates().await;
        self.directory.set_local_info(local).await;
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer_id, latency } => {
                self.router.on_peer_connected(peer_id, latency).await;
                let improved = {
                    let mut best = self.best_latency.write().await;
                    let improved = best.map_or(true, |b| latency < b);
                    if improved {
                        *best = Some(latency);
                    }
                    improved
                };
                if improved {
                    self.update_advertisement(self.nat.nat_type().await).await;
                }
                self.events.publish(OverlayEvent::PeerConnected { peer_id });
            }
            PeerEvent::Disconnected { peer_id } => {
                self.router.on_peer_disconnected(peer_id).await;
                self.events.publish(OverlayEvent::PeerDisconnected { peer_id });
            }
            PeerEvent::Pruned { peer_id } => {
                self.router.on_peer_disconnected(peer_id).await;
            }
        }
    }

    /// Handle one inbound envelope
    async fn dispatch(&self, message: InboundMessage) {
        let InboundMessage { from, envelope } = message;
        trace!("Dispatching {} from {}", envelope.body.kind(), from);
        self.directory.touch(&envelope.node_id).await;

        match &envelope.body {
            MessageBody::Handshake { info } => {
                if info.addr != from {
                    debug!("Handshake from {} advertises {}", from, info.addr);
                }
                self.directory.add_peer(info.clone()).await;
            }
            MessageBody::Ping { nonce } => {
                let pong = Envelope::new(self.local_id().await, MessageBody::Pong { nonce: *nonce });
                if let Err(e) = self.transport.send(from, &pong).await {
                    debug!("Pong to {} failed: {}", from, e);
                }
            }
            MessageBody::Pong { nonce } => {
                let expected = match &self.ping {
                    Some(ping) => ping.on_pong(*nonce).await,
                    None => false,
                };
                if !expected {
                    trace!("Unsolicited pong {} from {}", nonce, from);
                }
            }
            MessageBody::DhtQuery { .. }
            | MessageBody::DhtResponse { .. }
            | MessageBody::DhtStore { .. }
            | MessageBody::FilterRequest { .. } => {
                if let Err(e) = self.dht.handle_message(from, &envelope).await {
                    debug!("DHT message from {} failed: {}", from, e);
                }
            }
            MessageBody::FilterResponse {
                request_id,
                name,
                content,
            } => match content {
                Some(content) => {
                    if !self.filter_requests.complete(*request_id, content.clone()).await {
                        trace!("Late filter response for '{}'", name);
                    }
                }
                // Other asked peers may still have it
                None => trace!("Peer {} lacks filter list '{}'", envelope.node_id, name),
            },
            MessageBody::RoutingUpdate { routes } => {
                let learned = self.router.handle_routing_update(envelope.node_id, routes).await;
                trace!("Routing update from {}: {} routes learned", envelope.node_id, learned);
            }
            MessageBody::Routed(routed) => match self.router.handle_routed(routed.clone()).await {
                Ok(RouteOutcome::Delivered { source, payload }) => {
                    debug!("Routed payload from {} ({} bytes)", source, payload.len());
                }
                Ok(outcome) => trace!("Routed message: {:?}", outcome),
                Err(e) => debug!("Routing from {} failed: {}", from, e),
            },
        }
    }

    async fn spawn_dispatch(self: &Arc<Self>) {
        let Some(mut inbound) = self.inbound.lock().await.take() else {
            error!("Inbound channel already taken, mesh messages will not be handled");
            return;
        };

        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbound.recv() => match message {
                        Some(message) => engine.dispatch(message).await,
                        None => {
                            warn!("Mesh transport closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
            *engine.inbound.lock().await = Some(inbound);
            debug!("Dispatch loop stopped");
        });
        self.tasks.lock().await.push(handle);
    }

    /// Forward directory and relay notifications onto the event bus
    async fn spawn_event_forwarders(self: &Arc<Self>) {
        let engine = self.clone();
        let mut peers = self.directory.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let peer_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = peers.recv() => match event {
                        Ok(event) => engine.on_peer_event(event).await,
                        Err(RecvError::Lagged(n)) => warn!("Missed {} peer events", n),
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        let events = self.events.clone();
        let mut relay_events = self.relays.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let relay_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = relay_events.recv() => match event {
                        Ok(RelayEvent::Closed { session_id, reason }) => {
                            events.publish(OverlayEvent::RelaySessionClosed {
                                session_id,
                                reason: reason.to_string(),
                            });
                        }
                        Ok(RelayEvent::Established { session_id, relay }) => {
                            debug!("Relay session {} via {}", session_id, relay);
                        }
                        Err(RecvError::Lagged(n)) => warn!("Missed {} relay events", n),
                        Err(RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(peer_task);
        tasks.push(relay_task);
    }

    /// Run `tick` every `period` until shutdown
    async fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F)
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let engine = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick(engine.clone()).await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("{} loop stopped", name);
        });
        self.tasks.lock().await.push(handle);
    }

    async fn spawn_maintenance(self: &Arc<Self>) {
        let batch = self.config.max_maintenance_batch;

        self.spawn_loop("discovery", self.config.discovery.maintain_interval(), |e| async move {
            let (pruned, reconnecting) = e.directory.maintain().await;
            if pruned > 0 || reconnecting > 0 {
                debug!("Discovery: {} pruned, {} reconnecting", pruned, reconnecting);
            }
        })
        .await;

        self.spawn_loop("announce", self.config.discovery.announce_interval(), |e| async move {
            e.directory.announce().await;
        })
        .await;

        self.spawn_loop("nat", self.config.nat.reclassify_interval(), |e| async move {
            e.reclassify_nat().await;
        })
        .await;

        self.spawn_loop("dht", self.config.dht.expiry_interval(), |e| async move {
            e.dht.maintain().await;
        })
        .await;

        self.spawn_loop("mesh", self.config.mesh.update_interval(), |e| async move {
            let expired = e.router.expire_stale().await;
            let sent = e.router.propagate().await;
            trace!("Mesh: {} routes expired, {} updates sent", expired, sent);
        })
        .await;

        self.spawn_loop("relay", self.config.relay.monitor_interval(), |e| async move {
            e.relays.monitor().await;
        })
        .await;

        self.spawn_loop("circuits", self.config.circuit.maintain_interval(), move |e| async move {
            e.circuits.maintain(batch).await;
        })
        .await;

        self.spawn_loop(
            "bridge health",
            self.config.bridge.health_check_interval(),
            move |e| async move {
                let report = e.bridges.health_check(batch).await;
                if report.evicted > 0 && e.circuits.bridges_only().await {
                    e.refresh_entry_bridges().await;
                }
            },
        )
        .await;

        self.spawn_loop("bridge sessions", self.config.bridge.monitor_interval(), |e| async move {
            e.bridges.monitor_sessions().await;
        })
        .await;

        self.spawn_loop("onion", self.config.onion.cleanup_interval(), |e| async move {
            let (expired, points) = e.onion.cleanup().await;
            if expired > 0 || points > 0 {
                debug!("Onion cleanup: {} cache entries, {} rendezvous points", expired, points);
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use oblivion_net::{
        Candidate, CandidateKind, MemoryHub, NetworkResult, PunchStrategy,
    };

    use crate::bridge::tests::{descriptor, ScriptedTransport};
    use crate::bridge::TransportKind;
    use crate::circuit::tests::{directory, FakeConnector};
    use crate::onion::tests::{intro, service, FakeFetcher, FakeHandshake};
    use crate::onion::ServiceDescriptor;

    struct NoBootstrap;

    #[async_trait]
    impl BootstrapSource for NoBootstrap {
        async fn fetch_peers(&self, _endpoint: &str) -> NetworkResult<Vec<PeerInfo>> {
            Ok(Vec::new())
        }
    }

    /// Reports one consistent mapped address: a cone NAT
    struct ConeProbe;

    #[async_trait]
    impl ReachabilityProbe for ConeProbe {
        async fn probe(&self, server: &str) -> NetworkResult<Vec<Candidate>> {
            Ok(vec![
                Candidate::new(CandidateKind::Host, "192.168.1.20:9443".parse().unwrap(), server),
                Candidate::new(
                    CandidateKind::ServerReflexive,
                    "203.0.113.7:40000".parse().unwrap(),
                    server,
                ),
            ])
        }
    }

    struct NoPunch;

    #[async_trait]
    impl StrategyExecutor for NoPunch {
        async fn attempt(&self, strategy: PunchStrategy, _target: &PunchTarget) -> NetworkResult<SocketAddr> {
            Err(NetworkError::NatTraversalFailed(strategy.to_string()))
        }
    }

    /// Only simultaneous open against a shared reflexive mapping works
    struct ReflexiveOnly;

    #[async_trait]
    impl StrategyExecutor for ReflexiveOnly {
        async fn attempt(&self, strategy: PunchStrategy, target: &PunchTarget) -> NetworkResult<SocketAddr> {
            match strategy {
                PunchStrategy::ServerReflexive => target
                    .candidates_of(CandidateKind::ServerReflexive)
                    .first()
                    .copied()
                    .ok_or_else(|| NetworkError::NatTraversalFailed("no reflexive candidate".into())),
                other => Err(NetworkError::NatTraversalFailed(other.to_string())),
            }
        }
    }

    fn test_config() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.nat.stun_servers = vec!["stun.test:3478".into()];
        config.hole_punch.max_attempts = 1;
        config.discovery.connect_timeout_ms = 1_000;
        config.dht.query_timeout_ms = 500;
        config
    }

    async fn engine(hub: &MemoryHub, n: u8) -> Arc<OverlayEngine> {
        engine_with(hub, n, Arc::new(NoPunch)).await
    }

    async fn engine_with(hub: &MemoryHub, n: u8, punch: Arc<dyn StrategyExecutor>) -> Arc<OverlayEngine> {
        let addr: SocketAddr = format!("10.0.0.{}:9443", n).parse().unwrap();
        let (transport, inbound) = hub.endpoint(addr).await;

        let mut transports = TransportRegistry::new();
        transports.register(Arc::new(ScriptedTransport {
            kind: TransportKind::Obfs4,
            latencies: HashMap::new(),
            down: Mutex::new(HashSet::new()),
        }));

        let mut descriptors = HashMap::new();
        descriptors.insert(
            service(1),
            ServiceDescriptor {
                introduction_points: vec![intro(1)],
                requires_auth: false,
            },
        );

        let components = Components {
            transport,
            inbound,
            bootstrap: Arc::new(NoBootstrap),
            connector: None,
            probe: Arc::new(ConeProbe),
            punch,
            negotiator: None,
            hops: Arc::new(FakeConnector::default()),
            transports,
            descriptors: Some(Arc::new(FakeFetcher {
                descriptors,
                calls: AtomicUsize::new(0),
            })),
            rendezvous: Arc::new(FakeHandshake {
                refuse: Vec::new(),
                attempts: AtomicUsize::new(0),
            }),
        };
        let bootstrap = Bootstrap {
            bridges: vec![descriptor(1, "obfs4"), descriptor(2, "obfs4")],
            relays: directory().await.snapshot().await,
        };
        OverlayEngine::new(test_config(), PeerId::random(), components, bootstrap).unwrap()
    }

    async fn wait_connected(engine: &OverlayEngine, count: usize) {
        for _ in 0..200 {
            if engine.directory().connected_count().await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peers never connected");
    }

    async fn wait_routes(engine: &OverlayEngine, count: usize) {
        for _ in 0..200 {
            if engine.status().await.routes == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("route table never reached {} entries", count);
    }

    /// Two running engines, `a` connected to `b`
    async fn linked_pair(hub: &MemoryHub) -> (Arc<OverlayEngine>, Arc<OverlayEngine>) {
        let a = engine(hub, 1).await;
        let b = engine(hub, 2).await;
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();
        a.directory().add_peer(b.directory().local_info().await).await;
        wait_connected(&a, 1).await;
        wait_routes(&a, 1).await;
        (a, b)
    }

    #[tokio::test]
    async fn test_initialize_builds_pool() {
        let hub = MemoryHub::new();
        let engine = engine(&hub, 1).await;
        let mut events = engine.subscribe();

        engine.initialize().await.unwrap();
        let status = engine.status().await;
        assert_eq!(status.state, EngineState::Running);
        assert_eq!(status.nat_type, NatType::Cone);
        assert_eq!(status.circuits.ready, 2);
        assert_eq!(status.relays_known, 4);
        assert_eq!(status.active_bridges, 2);
        assert!(!status.bridges_only);

        assert_eq!(
            events.recv().await.unwrap(),
            OverlayEvent::NatTypeChanged {
                previous: NatType::Unknown,
                current: NatType::Cone
            }
        );
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_require_running_engine() {
        let hub = MemoryHub::new();
        let engine = engine(&hub, 1).await;
        assert!(matches!(engine.resolve(&service(1)).await, Err(CoreError::NotRunning)));
        assert!(matches!(
            engine.request_filter_list("easylist").await,
            Err(CoreError::NotRunning)
        ));
        assert!(matches!(engine.relay_data(1, b"x").await, Err(CoreError::NotRunning)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_filter_waiters() {
        let hub = MemoryHub::new();
        let engine = engine(&hub, 1).await;
        engine.initialize().await.unwrap();

        let (_, waiter) = engine.filter_requests.register().await;
        engine.shutdown().await.unwrap();
        assert!(waiter.await.is_err());
        assert_eq!(engine.filter_requests.outstanding().await, 0);
    }

    #[tokio::test]
    async fn test_identity_rotation_keeps_neighbour_routes() {
        let hub = MemoryHub::new();
        let (a, b) = linked_pair(&hub).await;
        let b_id = b.local_id().await;

        assert_eq!(a.send_to_peer(b_id, b"before".to_vec()).await.unwrap(), RouteOutcome::Direct);
        a.new_identity().await.unwrap();
        assert_eq!(a.send_to_peer(b_id, b"after".to_vec()).await.unwrap(), RouteOutcome::Direct);
        assert_eq!(a.status().await.routes, 1);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_neighbour_routes_removed() {
        let hub = MemoryHub::new();
        let (a, b) = linked_pair(&hub).await;
        let b_info = b.directory().local_info().await;
        let mut events = a.subscribe();

        hub.disconnect(&b_info.addr).await;
        assert!(a.send_to_peer(b_info.peer_id, vec![1]).await.is_err());

        let lost = OverlayEvent::PeerDisconnected { peer_id: b_info.peer_id };
        timeout(Duration::from_secs(2), async {
            while events.recv().await.unwrap() != lost {}
        })
        .await
        .unwrap();
        assert_eq!(a.status().await.routes, 0);
        assert!(!a.directory().get(&b_info.peer_id).await.unwrap().is_connected());
        assert!(a.send_to_peer(b_info.peer_id, vec![2]).await.is_err());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_punch_uses_shared_candidates() {
        let hub = MemoryHub::new();
        let a = engine_with(&hub, 1, Arc::new(ReflexiveOnly)).await;
        let b = engine(&hub, 2).await;
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        let b_info = b.directory().local_info().await;
        assert_eq!(b_info.nat_type, NatType::Cone);
        assert!(!b_info.candidates.is_empty());

        // No direct path to b
        hub.disconnect(&b_info.addr).await;
        a.directory().add_peer(b_info.clone()).await;

        match a.connect_to_peer(b_info.peer_id).await.unwrap() {
            PeerLink::Punched(outcome) => {
                assert_eq!(outcome.strategy, PunchStrategy::ServerReflexive);
                assert_eq!(outcome.remote_addr, "203.0.113.7:40000".parse().unwrap());
            }
            other => panic!("expected a punched link, got {:?}", other),
        }

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_and_restart() {
        let hub = MemoryHub::new();
        let engine = engine(&hub, 1).await;
        engine.initialize().await.unwrap();
        engine.shutdown().await.unwrap();

        let status = engine.status().await;
        assert_eq!(status.state, EngineState::Stopped);
        assert_eq!(status.circuits.ready, 0);

        engine.initialize().await.unwrap();
        assert_eq!(engine.state().await, EngineState::Running);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_blocking_switches_to_bridges() {
        let hub = MemoryHub::new();
        let engine = engine(&hub, 1).await;
        engine.initialize().await.unwrap();
        let mut events = engine.subscribe();

        assert!(engine.report_interference(InterferenceKind::RelayBlocked, "guard").await);
        let status = engine.status().await;
        assert!(status.bridges_only);
        assert_eq!(status.circuits.degraded, 2);
        assert_eq!(status.interference_reports, 1);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&OverlayEvent::BridgesOnly));

        // New circuits enter through a bridge
        let id = engine
            .circuits()
            .create_circuit(CircuitPurpose::General, None)
            .await
            .unwrap();
        let circuit = engine.circuits().get(id).await.unwrap();
        let guard = circuit.read().await.hops()[0].fingerprint.clone();
        assert!(guard == descriptor(1, "obfs4").fingerprint || guard == descriptor(2, "obfs4").fingerprint);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_identity_rebuilds_pool() {
        let hub = MemoryHub::new();
        let engine = engine(&hub, 1).await;
        engine.initialize().await.unwrap();
        let before_id = engine.local_id().await;
        let before: HashSet<_> = engine.circuits().circuit_ids().await.into_iter().collect();
        engine.resolve(&service(1)).await.unwrap();

        let after_id = engine.new_identity().await.unwrap();
        assert_ne!(before_id, after_id);
        assert_eq!(engine.local_id().await, after_id);

        let after: HashSet<_> = engine.circuits().circuit_ids().await.into_iter().collect();
        assert_eq!(after.len(), 2);
        assert!(before.is_disjoint(&after));
        assert_eq!(engine.status().await.onion_cache.entries, 0);
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_peer_falls_back_to_relay() {
        let hub = MemoryHub::new();
        let engine = engine(&hub, 1).await;
        engine.initialize().await.unwrap();

        let ghost = PeerInfo::new(PeerId::random(), "10.9.9.9:9443".parse().unwrap());
        engine.directory().add_peer(ghost.clone()).await;

        // No relay-capable peer is connected, so every stage fails
        let err = engine.connect_to_peer(ghost.peer_id).await.unwrap_err();
        assert!(matches!(err, CoreError::NetworkError(NetworkError::NoRelayAvailable)));

        let err = engine.connect_to_peer(PeerId::random()).await.unwrap_err();
        assert!(matches!(err, CoreError::NetworkError(NetworkError::PeerNotFound(_))));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_list_from_peer() {
        let hub = MemoryHub::new();
        let a = engine(&hub, 1).await;
        let b = engine(&hub, 2).await;
        a.initialize().await.unwrap();
        b.initialize().await.unwrap();

        // Published before the nodes know each other, so b holds the only copy
        b.publish_filter_list("easylist", b"||ads.example^".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        a.directory().add_peer(b.directory().local_info().await).await;
        wait_connected(&a, 1).await;

        let content = a.request_filter_list("easylist").await.unwrap();
        assert_eq!(content, b"||ads.example^".to_vec());

        assert!(a.request_filter_list("missing").await.is_err());
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_through_engine() {
        let hub = MemoryHub::new();
        let engine = engine(&hub, 1).await;
        engine.initialize().await.unwrap();
        let mut events = engine.subscribe();

        let resolution = engine.resolve(&service(1)).await.unwrap();
        assert_eq!(resolution.address.as_str(), service(1));
        let mut resolved = false;
        while let Ok(event) = events.try_recv() {
            resolved |= event == OverlayEvent::OnionResolved { address: service(1) };
        }
        assert!(resolved);
        engine.shutdown().await.unwrap();
    }
}
