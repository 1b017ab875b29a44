//! Peer Directory & Discovery
//!
//! Keeps the table of known peers, pulls peer lists from bootstrap
//! endpoints, announces our presence to connected peers and prunes peers
//! that stay disconnected past a stale threshold.
//!
//! The directory enforces two ceilings: `max_peers` bounds the table
//! itself (`add_peer` returns false when full) and `max_connections`
//! bounds how many peers we hold connected or connecting at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{NetworkError, NetworkResult};
use crate::nat::{shareable_candidates, Candidate};
use crate::protocol::{
    ConnectionState, Envelope, MessageBody, NatType, PeerCapabilities, PeerId, PeerInfo,
};
use crate::transport::{PeerTransport, RequestTracker};

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Bootstrap endpoint URLs returning a JSON peer list
    pub bootstrap_endpoints: Vec<String>,
    /// Maximum peers kept in the directory
    pub max_peers: usize,
    /// Maximum peers connected or connecting at once
    pub max_connections: usize,
    /// Disconnected peers older than this are pruned (seconds)
    pub stale_timeout_secs: u64,
    /// Connected peers silent for this long are marked disconnected (seconds)
    pub liveness_timeout_secs: u64,
    /// Interval between presence announcements (seconds)
    pub announce_interval_secs: u64,
    /// Interval between maintenance passes (seconds)
    pub maintain_interval_secs: u64,
    /// Per-connection attempt timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Per-endpoint bootstrap fetch timeout (milliseconds)
    pub bootstrap_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_endpoints: Vec::new(),
            max_peers: 256,
            max_connections: 32,
            stale_timeout_secs: 600,
            liveness_timeout_secs: 300,
            announce_interval_secs: 120,
            maintain_interval_secs: 30,
            connect_timeout_ms: 5_000,
            bootstrap_timeout_ms: 10_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }

    pub fn maintain_interval(&self) -> Duration {
        Duration::from_secs(self.maintain_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_peers == 0 {
            return Err("max_peers must be at least 1".into());
        }
        if self.max_connections > self.max_peers {
            return Err("max_connections cannot exceed max_peers".into());
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be non-zero".into());
        }
        if self.liveness_timeout_secs <= self.announce_interval_secs {
            return Err("liveness_timeout_secs must exceed announce_interval_secs".into());
        }
        Ok(())
    }
}

/// A known peer
#[derive(Debug, Clone)]
pub struct Peer {
    pub info: PeerInfo,
    pub state: ConnectionState,
    /// Round trip measured by the last successful connect
    pub latency: Option<Duration>,
    pub last_seen: Instant,
    /// Set while disconnected; drives stale pruning
    pub disconnected_since: Option<Instant>,
}

impl Peer {
    fn new(info: PeerInfo) -> Self {
        let now = Instant::now();
        Self {
            info,
            state: ConnectionState::Disconnected,
            latency: None,
            last_seen: now,
            disconnected_since: Some(now),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Directory change notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected { peer_id: PeerId, latency: Duration },
    Disconnected { peer_id: PeerId },
    Pruned { peer_id: PeerId },
}

/// Source of bootstrap peer lists
#[async_trait]
pub trait BootstrapSource: Send + Sync {
    async fn fetch_peers(&self, endpoint: &str) -> NetworkResult<Vec<PeerInfo>>;
}

/// Establishes connectivity to a peer, returning the measured round trip
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, peer: &PeerInfo) -> NetworkResult<Duration>;
}

/// Peer entry as served by bootstrap endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootstrapPeer {
    /// Full hex peer id
    peer_id: String,
    addr: SocketAddr,
    #[serde(default)]
    nat_type: Option<NatType>,
    #[serde(default)]
    capabilities: PeerCapabilities,
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootstrapResponse {
    peers: Vec<BootstrapPeer>,
}

/// Fetches `{"peers": [...]}` documents over HTTPS
pub struct HttpBootstrap {
    client: reqwest::Client,
}

impl HttpBootstrap {
    pub fn new(request_timeout: Duration) -> NetworkResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NetworkError::ConfigError(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BootstrapSource for HttpBootstrap {
    async fn fetch_peers(&self, endpoint: &str) -> NetworkResult<Vec<PeerInfo>> {
        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| NetworkError::BootstrapFailed(format!("{}: {}", endpoint, e)))?;

        let body: BootstrapResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::BootstrapFailed(format!("{}: bad peer list: {}", endpoint, e)))?;

        let peers = body
            .peers
            .into_iter()
            .filter_map(|p| {
                let peer_id = PeerId::from_hex(&p.peer_id)?;
                Some(PeerInfo {
                    peer_id,
                    addr: p.addr,
                    nat_type: p.nat_type.unwrap_or_default(),
                    capabilities: p.capabilities,
                    candidates: shareable_candidates(&p.candidates),
                })
            })
            .collect();
        Ok(peers)
    }
}

/// Connects by ping/pong over the mesh transport
pub struct PingConnector {
    local_id: PeerId,
    transport: Arc<dyn PeerTransport>,
    pending: RequestTracker<()>,
    ping_timeout: Duration,
}

impl PingConnector {
    pub fn new(local_id: PeerId, transport: Arc<dyn PeerTransport>, ping_timeout: Duration) -> Self {
        Self {
            local_id,
            transport,
            pending: RequestTracker::new(),
            ping_timeout,
        }
    }

    /// Feed a received pong; returns false if nobody was waiting for it
    pub async fn on_pong(&self, nonce: u64) -> bool {
        self.pending.complete(nonce, ()).await
    }
}

#[async_trait]
impl PeerConnector for PingConnector {
    async fn connect(&self, peer: &PeerInfo) -> NetworkResult<Duration> {
        let (nonce, rx) = self.pending.register().await;
        let started = Instant::now();

        let ping = Envelope::new(self.local_id, MessageBody::Ping { nonce });
        if let Err(e) = self.transport.send(peer.addr, &ping).await {
            self.pending.cancel(nonce).await;
            return Err(e);
        }

        match timeout(self.ping_timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(NetworkError::Cancelled),
            Err(_) => {
                self.pending.cancel(nonce).await;
                Err(NetworkError::Timeout)
            }
        }
    }
}

/// Peer directory
pub struct PeerDirectory {
    local: RwLock<PeerInfo>,
    config: DiscoveryConfig,
    peers: RwLock<HashMap<PeerId, Peer>>,
    connector: Arc<dyn PeerConnector>,
    bootstrap: Arc<dyn BootstrapSource>,
    transport: Arc<dyn PeerTransport>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerDirectory {
    pub fn new(
        local: PeerInfo,
        config: DiscoveryConfig,
        transport: Arc<dyn PeerTransport>,
        connector: Arc<dyn PeerConnector>,
        bootstrap: Arc<dyn BootstrapSource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            local: RwLock::new(local),
            config,
            peers: RwLock::new(HashMap::new()),
            connector,
            bootstrap,
            transport,
            events,
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub async fn local_info(&self) -> PeerInfo {
        self.local.read().await.clone()
    }

    pub async fn local_id(&self) -> PeerId {
        self.local.read().await.peer_id
    }

    /// Update what we advertise (new NAT type, capabilities, identity)
    pub async fn set_local_info(&self, info: PeerInfo) {
        *self.local.write().await = info;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Insert or refresh a peer.
    ///
    /// Returns false when the directory is full or the peer is ourselves.
    /// A new peer triggers a background connection attempt if we are below
    /// the connection cap.
    pub async fn add_peer(self: &Arc<Self>, info: PeerInfo) -> bool {
        if info.peer_id == self.local_id().await {
            return false;
        }

        let should_connect = {
            let mut peers = self.peers.write().await;

            if let Some(existing) = peers.get_mut(&info.peer_id) {
                existing.info = info;
                existing.last_seen = Instant::now();
                return true;
            }

            if peers.len() >= self.config.max_peers {
                debug!("Peer directory full, rejecting {}", info.peer_id);
                return false;
            }

            let active = peers
                .values()
                .filter(|p| p.state != ConnectionState::Disconnected)
                .count();
            let peer_id = info.peer_id;
            peers.insert(peer_id, Peer::new(info));
            debug!("Added peer {} ({} known)", peer_id, peers.len());

            if active < self.config.max_connections {
                // Claim the slot before releasing the lock
                if let Some(p) = peers.get_mut(&peer_id) {
                    p.state = ConnectionState::Connecting;
                }
                Some(peer_id)
            } else {
                None
            }
        };

        if let Some(peer_id) = should_connect {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.connect_peer(peer_id).await;
            });
        }

        true
    }

    /// Attempt a connection to a known peer
    pub async fn connect_peer(&self, peer_id: PeerId) -> NetworkResult<Duration> {
        let (info, was_connected) = {
            let mut peers = self.peers.write().await;
            let peer = peers
                .get_mut(&peer_id)
                .ok_or_else(|| NetworkError::PeerNotFound(peer_id.to_string()))?;
            let was_connected = peer.is_connected();
            peer.state = ConnectionState::Connecting;
            (peer.info.clone(), was_connected)
        };

        let result = timeout(self.config.connect_timeout(), self.connector.connect(&info))
            .await
            .map_err(NetworkError::from)
            .and_then(|r| r);

        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(&peer_id) else {
            // Pruned while we were connecting
            return Err(NetworkError::Cancelled);
        };

        match result {
            Ok(latency) => {
                peer.state = ConnectionState::Connected;
                peer.latency = Some(latency);
                peer.last_seen = Instant::now();
                peer.disconnected_since = None;
                info!("Connected to peer {} at {} ({:?})", peer_id, info.addr, latency);
                let _ = self.events.send(PeerEvent::Connected { peer_id, latency });
                Ok(latency)
            }
            Err(e) => {
                peer.state = ConnectionState::Disconnected;
                peer.disconnected_since.get_or_insert_with(Instant::now);
                debug!("Connection to peer {} failed: {}", peer_id, e);
                if was_connected {
                    info!("Peer {} lost", peer_id);
                    let _ = self.events.send(PeerEvent::Disconnected { peer_id });
                }
                Err(e)
            }
        }
    }

    /// Mark a peer as disconnected (e.g. after repeated send failures)
    pub async fn mark_disconnected(&self, peer_id: &PeerId) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(peer_id) {
            if peer.state != ConnectionState::Disconnected {
                peer.state = ConnectionState::Disconnected;
                peer.disconnected_since = Some(Instant::now());
                info!("Peer {} disconnected", peer_id);
                let _ = self.events.send(PeerEvent::Disconnected { peer_id: *peer_id });
            }
        }
    }

    /// Record traffic from a peer
    pub async fn touch(&self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.write().await.get_mut(peer_id) {
            peer.last_seen = Instant::now();
        }
    }

    /// Fetch peer lists from every bootstrap endpoint concurrently.
    ///
    /// Returns how many peers were accepted into the directory.
    pub async fn discover(self: &Arc<Self>) -> NetworkResult<usize> {
        let endpoints = self.config.bootstrap_endpoints.clone();
        if endpoints.is_empty() {
            debug!("No bootstrap endpoints configured");
            return Ok(0);
        }

        info!("Discovering peers from {} bootstrap endpoints", endpoints.len());

        let mut fetches = JoinSet::new();
        for endpoint in endpoints {
            let source = self.bootstrap.clone();
            let limit = self.config.bootstrap_timeout();
            fetches.spawn(async move {
                let result = timeout(limit, source.fetch_peers(&endpoint))
                    .await
                    .map_err(NetworkError::from)
                    .and_then(|r| r);
                (endpoint, result)
            });
        }

        let mut added = 0;
        let mut reachable = 0;
        let mut last_error = None;
        while let Some(joined) = fetches.join_next().await {
            let Ok((endpoint, result)) = joined else { continue };
            match result {
                Ok(peers) => {
                    reachable += 1;
                    debug!("Bootstrap {} returned {} peers", endpoint, peers.len());
                    for info in peers {
                        if self.add_peer(info).await {
                            added += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Bootstrap {} failed: {}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }

        if reachable == 0 {
            return Err(NetworkError::BootstrapFailed(
                last_error.map(|e| e.to_string()).unwrap_or_default(),
            ));
        }

        info!("Discovery added {} peers", added);
        Ok(added)
    }

    /// Send a handshake carrying our info to every connected peer
    pub async fn announce(&self) -> usize {
        let local = self.local_info().await;
        let targets: Vec<SocketAddr> = self
            .connected_peers()
            .await
            .into_iter()
            .map(|p| p.addr)
            .collect();

        let envelope = Envelope::new(local.peer_id, MessageBody::Handshake { info: local });
        let mut sent = 0;
        for addr in targets {
            match timeout(self.config.connect_timeout(), self.transport.send(addr, &envelope)).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => debug!("Announce to {} failed: {}", addr, e),
                Err(_) => debug!("Announce to {} timed out", addr),
            }
        }
        debug!("Announced presence to {} peers", sent);
        sent
    }

    /// Drop silent peers to disconnected, prune stale peers and reconnect
    /// up to the connection target.
    ///
    /// Returns (pruned, reconnect attempts started).
    pub async fn maintain(self: &Arc<Self>) -> (usize, usize) {
        let now = Instant::now();
        let stale_after = self.config.stale_timeout();
        let silent_after = self.config.liveness_timeout();

        let (pruned, reconnect) = {
            let mut peers = self.peers.write().await;

            for peer in peers.values_mut() {
                if peer.is_connected() && now.duration_since(peer.last_seen) >= silent_after {
                    peer.state = ConnectionState::Disconnected;
                    peer.disconnected_since = Some(now);
                    info!("Peer {} silent for {:?}, marking disconnected", peer.info.peer_id, silent_after);
                    let _ = self.events.send(PeerEvent::Disconnected {
                        peer_id: peer.info.peer_id,
                    });
                }
            }

            let stale: Vec<PeerId> = peers
                .iter()
                .filter(|(_, p)| {
                    p.state == ConnectionState::Disconnected
                        && p.disconnected_since
                            .map(|since| now.duration_since(since) >= stale_after)
                            .unwrap_or(false)
                })
                .map(|(id, _)| *id)
                .collect();

            for id in &stale {
                peers.remove(id);
                let _ = self.events.send(PeerEvent::Pruned { peer_id: *id });
            }

            let active = peers
                .values()
                .filter(|p| p.state != ConnectionState::Disconnected)
                .count();
            let budget = self.config.max_connections.saturating_sub(active);

            let mut candidates: Vec<&mut Peer> = peers
                .values_mut()
                .filter(|p| p.state == ConnectionState::Disconnected)
                .collect();
            // Most recently seen first
            candidates.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));

            let mut reconnect = Vec::new();
            for peer in candidates.into_iter().take(budget) {
                peer.state = ConnectionState::Connecting;
                reconnect.push(peer.info.peer_id);
            }

            (stale.len(), reconnect)
        };

        if pruned > 0 {
            info!("Pruned {} stale peers", pruned);
        }

        let started = reconnect.len();
        for peer_id in reconnect {
            let this = self.clone();
            tokio::spawn(async move {
                let _ = this.connect_peer(peer_id).await;
            });
        }

        (pruned, started)
    }

    pub async fn get(&self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Find a peer by its transport address
    pub async fn find_by_addr(&self, addr: &SocketAddr) -> Option<Peer> {
        self.peers
            .read()
            .await
            .values()
            .find(|p| p.info.addr == *addr)
            .cloned()
    }

    pub async fn connected_peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_connected())
            .map(|p| p.info.clone())
            .collect()
    }

    /// Connected relay-capable peers, lowest latency first
    pub async fn relay_candidates(&self) -> Vec<(PeerInfo, Duration)> {
        let mut candidates: Vec<(PeerInfo, Duration)> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| p.is_connected() && p.info.capabilities.relay)
            .map(|p| (p.info.clone(), p.latency.unwrap_or(Duration::MAX)))
            .collect();
        candidates.sort_by_key(|(_, latency)| *latency);
        candidates
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn connected_count(&self) -> usize {
        self.peers.read().await.values().filter(|p| p.is_connected()).count()
    }

    /// Drop every peer (identity rotation)
    pub async fn clear(&self) {
        self.peers.write().await.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::transport::MemoryHub;

    /// Connector that always succeeds with a fixed round trip
    pub(crate) struct FixedConnector {
        pub latency: Duration,
        pub calls: AtomicUsize,
        pub fail: bool,
    }

    impl FixedConnector {
        pub(crate) fn ok(latency_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                latency: Duration::from_millis(latency_ms),
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                latency: Duration::ZERO,
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl PeerConnector for FixedConnector {
        async fn connect(&self, _peer: &PeerInfo) -> NetworkResult<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NetworkError::ConnectionFailed("refused".into()))
            } else {
                Ok(self.latency)
            }
        }
    }

    pub(crate) struct StaticBootstrap {
        pub peers: HashMap<String, Vec<PeerInfo>>,
    }

    #[async_trait]
    impl BootstrapSource for StaticBootstrap {
        async fn fetch_peers(&self, endpoint: &str) -> NetworkResult<Vec<PeerInfo>> {
            self.peers
                .get(endpoint)
                .cloned()
                .ok_or_else(|| NetworkError::BootstrapFailed(endpoint.to_string()))
        }
    }

    pub(crate) fn peer_info(n: u8) -> PeerInfo {
        PeerInfo::new(PeerId([n; 32]), SocketAddr::from(([10, 0, 0, n], 7000)))
    }

    pub(crate) async fn directory(
        config: DiscoveryConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<PeerDirectory> {
        let hub = MemoryHub::new();
        let (transport, _rx) = hub.endpoint(SocketAddr::from(([10, 0, 0, 254], 7000))).await;
        let bootstrap = Arc::new(StaticBootstrap { peers: HashMap::new() });
        PeerDirectory::new(peer_info(254), config, transport, connector, bootstrap)
    }

    #[tokio::test]
    async fn test_add_peer_respects_cap() {
        let config = DiscoveryConfig {
            max_peers: 2,
            max_connections: 2,
            ..Default::default()
        };
        let dir = directory(config, FixedConnector::ok(10)).await;

        assert!(dir.add_peer(peer_info(1)).await);
        assert!(dir.add_peer(peer_info(2)).await);
        assert!(!dir.add_peer(peer_info(3)).await);
        // Refreshing an existing peer is always accepted
        assert!(dir.add_peer(peer_info(1)).await);
        assert_eq!(dir.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_add_peer_rejects_self() {
        let dir = directory(DiscoveryConfig::default(), FixedConnector::ok(10)).await;
        assert!(!dir.add_peer(peer_info(254)).await);
    }

    #[tokio::test]
    async fn test_connect_peer_records_latency() {
        let dir = directory(DiscoveryConfig::default(), FixedConnector::ok(25)).await;
        let mut events = dir.subscribe();

        dir.add_peer(peer_info(1)).await;
        let latency = dir.connect_peer(PeerId([1; 32])).await.unwrap();
        assert_eq!(latency, Duration::from_millis(25));

        let peer = dir.get(&PeerId([1; 32])).await.unwrap();
        assert!(peer.is_connected());
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Connected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintain_prunes_stale() {
        let config = DiscoveryConfig {
            stale_timeout_secs: 60,
            max_connections: 0,
            ..Default::default()
        };
        let dir = directory(config, FixedConnector::failing()).await;

        dir.add_peer(peer_info(1)).await;
        assert_eq!(dir.maintain().await, (0, 0));

        tokio::time::advance(Duration::from_secs(61)).await;
        let (pruned, _) = dir.maintain().await;
        assert_eq!(pruned, 1);
        assert_eq!(dir.peer_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_marked_disconnected() {
        let config = DiscoveryConfig {
            liveness_timeout_secs: 200,
            max_connections: 0,
            ..Default::default()
        };
        let dir = directory(config, FixedConnector::ok(10)).await;
        let mut events = dir.subscribe();

        dir.add_peer(peer_info(1)).await;
        dir.add_peer(peer_info(2)).await;
        dir.connect_peer(PeerId([1; 32])).await.unwrap();
        dir.connect_peer(PeerId([2; 32])).await.unwrap();
        for _ in 0..2 {
            assert!(matches!(events.recv().await.unwrap(), PeerEvent::Connected { .. }));
        }

        tokio::time::advance(Duration::from_secs(150)).await;
        dir.touch(&PeerId([2; 32])).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        dir.maintain().await;

        assert!(!dir.get(&PeerId([1; 32])).await.unwrap().is_connected());
        assert!(dir.get(&PeerId([2; 32])).await.unwrap().is_connected());
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Disconnected { peer_id: PeerId([1; 32]) }
        );
    }

    /// Succeeds until switched off
    struct SwitchConnector {
        up: AtomicBool,
    }

    #[async_trait]
    impl PeerConnector for SwitchConnector {
        async fn connect(&self, _peer: &PeerInfo) -> NetworkResult<Duration> {
            if self.up.load(Ordering::SeqCst) {
                Ok(Duration::from_millis(10))
            } else {
                Err(NetworkError::Timeout)
            }
        }
    }

    #[tokio::test]
    async fn test_failed_reconnect_of_connected_peer_reports_loss() {
        let connector = Arc::new(SwitchConnector {
            up: AtomicBool::new(true),
        });
        let config = DiscoveryConfig {
            max_connections: 0,
            ..Default::default()
        };
        let dir = directory(config, connector.clone()).await;
        let mut events = dir.subscribe();

        dir.add_peer(peer_info(1)).await;
        dir.connect_peer(PeerId([1; 32])).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Connected { .. }));

        connector.up.store(false, Ordering::SeqCst);
        assert!(dir.connect_peer(PeerId([1; 32])).await.is_err());
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Disconnected { peer_id: PeerId([1; 32]) }
        );

        // A peer that was never connected fails quietly
        dir.add_peer(peer_info(2)).await;
        assert!(dir.connect_peer(PeerId([2; 32])).await.is_err());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_maintain_reconnects_up_to_target() {
        let config = DiscoveryConfig {
            max_connections: 1,
            ..Default::default()
        };
        let connector = FixedConnector::failing();
        let dir = directory(config, connector.clone()).await;

        dir.add_peer(peer_info(1)).await;
        dir.add_peer(peer_info(2)).await;
        // Let the background attempt fail
        let _ = dir.connect_peer(PeerId([1; 32])).await;
        let _ = dir.connect_peer(PeerId([2; 32])).await;

        let (_, started) = dir.maintain().await;
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_discover_merges_endpoints() {
        let hub = MemoryHub::new();
        let (transport, _rx) = hub.endpoint(SocketAddr::from(([10, 0, 0, 254], 7000))).await;
        let mut lists = HashMap::new();
        lists.insert("https://a.example/peers".to_string(), vec![peer_info(1), peer_info(2)]);
        lists.insert("https://b.example/peers".to_string(), vec![peer_info(2), peer_info(3)]);

        let config = DiscoveryConfig {
            bootstrap_endpoints: vec![
                "https://a.example/peers".into(),
                "https://b.example/peers".into(),
                "https://down.example/peers".into(),
            ],
            ..Default::default()
        };
        let dir = PeerDirectory::new(
            peer_info(254),
            config,
            transport,
            FixedConnector::ok(5),
            Arc::new(StaticBootstrap { peers: lists }),
        );

        dir.discover().await.unwrap();
        assert_eq!(dir.peer_count().await, 3);
    }

    #[tokio::test]
    async fn test_discover_all_endpoints_down() {
        let config = DiscoveryConfig {
            bootstrap_endpoints: vec!["https://down.example/peers".into()],
            ..Default::default()
        };
        let dir = directory(config, FixedConnector::ok(5)).await;
        assert!(matches!(
            dir.discover().await,
            Err(NetworkError::BootstrapFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_candidates_sorted() {
        let dir = directory(DiscoveryConfig::default(), FixedConnector::ok(5)).await;
        let relay_caps = PeerCapabilities {
            relay: true,
            ..Default::default()
        };
        dir.add_peer(peer_info(1).with_capabilities(relay_caps)).await;
        dir.add_peer(peer_info(2)).await;
        dir.connect_peer(PeerId([1; 32])).await.unwrap();
        dir.connect_peer(PeerId([2; 32])).await.unwrap();

        let candidates = dir.relay_candidates().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.peer_id, PeerId([1; 32]));
    }

    #[tokio::test]
    async fn test_ping_connector_round_trip() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.endpoint(SocketAddr::from(([10, 0, 0, 1], 1))).await;
        let (_b, mut rx_b) = hub.endpoint(SocketAddr::from(([10, 0, 0, 2], 1))).await;

        let connector = Arc::new(PingConnector::new(PeerId([1; 32]), a, Duration::from_secs(1)));
        let responder = connector.clone();
        tokio::spawn(async move {
            if let Some(msg) = rx_b.recv().await {
                if let MessageBody::Ping { nonce } = msg.envelope.body {
                    responder.on_pong(nonce).await;
                }
            }
        });

        let target = PeerInfo::new(PeerId([2; 32]), SocketAddr::from(([10, 0, 0, 2], 1)));
        assert!(connector.connect(&target).await.is_ok());
    }
}
