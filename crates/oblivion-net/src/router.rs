//! Mesh Router
//!
//! Distance-vector routing over the peer mesh. Direct neighbours are
//! one-hop routes; neighbours advertise an abbreviated copy of their table
//! and we learn multi-hop routes through them. A route's next hop is
//! always a connected neighbour, so losing a neighbour prunes every route
//! through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::discovery::PeerDirectory;
use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{Envelope, MessageBody, PeerId, RouteAdvert, RoutedMessage};
use crate::transport::PeerTransport;

/// Mesh routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Maximum hops a routed message may take
    pub max_hops: u8,
    /// Learned (multi-hop) routes older than this are dropped (seconds)
    pub route_ttl_secs: u64,
    /// Maximum routes carried in one routing update
    pub max_routes_per_update: usize,
    /// Interval between periodic routing updates (seconds)
    pub update_interval_secs: u64,
    /// Send timeout for one hop (milliseconds)
    pub send_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_hops: 6,
            route_ttl_secs: 300,
            max_routes_per_update: 64,
            update_interval_secs: 60,
            send_timeout_ms: 2_000,
        }
    }
}

impl MeshConfig {
    pub fn route_ttl(&self) -> Duration {
        Duration::from_secs(self.route_ttl_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_hops == 0 {
            return Err("max_hops must be at least 1".into());
        }
        Ok(())
    }
}

/// Routing table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    pub next_hop: PeerId,
    pub hop_count: u8,
    pub latency_ms: u32,
    pub last_update: Instant,
}

/// What happened to a message handed to the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Sent straight to the destination
    Direct,
    /// Handed to a next hop
    Forwarded { next_hop: PeerId },
    /// Addressed to us
    Delivered { source: PeerId, payload: Vec<u8> },
    /// Hop limit reached or no route
    Dropped,
}

/// Mesh router
pub struct MeshRouter {
    local_id: RwLock<PeerId>,
    config: MeshConfig,
    transport: Arc<dyn PeerTransport>,
    directory: Arc<PeerDirectory>,
    routes: RwLock<HashMap<PeerId, RoutingEntry>>,
}

impl MeshRouter {
    pub fn new(
        local_id: PeerId,
        config: MeshConfig,
        transport: Arc<dyn PeerTransport>,
        directory: Arc<PeerDirectory>,
    ) -> Self {
        Self {
            local_id: RwLock::new(local_id),
            config,
            transport,
            directory,
            routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Switch identity and forget learned routes. Neighbour links stay,
    /// they do not depend on who we are.
    pub async fn reset(&self, local_id: PeerId) {
        *self.local_id.write().await = local_id;
        let mut routes = self.routes.write().await;
        routes.retain(|_, entry| entry.hop_count == 1);
        debug!("Routes reset, {} neighbours kept", routes.len());
    }

    /// A neighbour came up: record the one-hop route and advertise
    pub async fn on_peer_connected(&self, peer_id: PeerId, latency: Duration) {
        let latency_ms = latency.as_millis().min(u32::MAX as u128) as u32;
        self.routes.write().await.insert(
            peer_id,
            RoutingEntry {
                next_hop: peer_id,
                hop_count: 1,
                latency_ms,
                last_update: Instant::now(),
            },
        );
        debug!("Route to neighbour {} ({}ms)", peer_id, latency_ms);
        self.propagate().await;
    }

    /// A neighbour went away: drop it and every route through it
    pub async fn on_peer_disconnected(&self, peer_id: PeerId) {
        let removed = {
            let mut routes = self.routes.write().await;
            let before = routes.len();
            routes.retain(|dest, entry| *dest != peer_id && entry.next_hop != peer_id);
            before - routes.len()
        };
        if removed > 0 {
            debug!("Pruned {} routes through {}", removed, peer_id);
            self.propagate().await;
        }
    }

    /// Merge a neighbour's advertised routes
    pub async fn handle_routing_update(&self, from: PeerId, adverts: &[RouteAdvert]) -> usize {
        let local_id = *self.local_id.read().await;
        let mut routes = self.routes.write().await;

        let Some(link) = routes.get(&from).copied().filter(|e| e.hop_count == 1) else {
            trace!("Ignoring routing update from non-neighbour {}", from);
            return 0;
        };

        let now = Instant::now();
        let mut learned = 0;
        for advert in adverts {
            if advert.destination == local_id || advert.destination == from {
                continue;
            }
            let hop_count = advert.hops.saturating_add(1);
            if hop_count > self.config.max_hops {
                continue;
            }
            let candidate = RoutingEntry {
                next_hop: from,
                hop_count,
                latency_ms: advert.latency_ms.saturating_add(link.latency_ms),
                last_update: now,
            };

            let replace = match routes.get(&advert.destination) {
                None => true,
                // Refresh from the same next hop, or switch if strictly better
                Some(existing) => {
                    existing.next_hop == from
                        || (existing.hop_count, existing.latency_ms)
                            > (candidate.hop_count, candidate.latency_ms)
                }
            };
            if replace {
                routes.insert(advert.destination, candidate);
                learned += 1;
            }
        }
        learned
    }

    /// Send `payload` toward `destination`
    pub async fn route(&self, destination: PeerId, payload: Vec<u8>) -> NetworkResult<RouteOutcome> {
        let local_id = *self.local_id.read().await;
        let msg = RoutedMessage {
            destination,
            source: local_id,
            payload,
            hop_count: 1,
            max_hops: self.config.max_hops,
        };
        self.forward(msg).await
    }

    /// Handle a routed message that arrived from the mesh
    pub async fn handle_routed(&self, mut msg: RoutedMessage) -> NetworkResult<RouteOutcome> {
        let local_id = *self.local_id.read().await;
        if msg.destination == local_id {
            return Ok(RouteOutcome::Delivered {
                source: msg.source,
                payload: msg.payload,
            });
        }

        if msg.hop_count >= msg.max_hops.min(self.config.max_hops) {
            debug!(
                "Dropping message for {}: hop limit {} reached",
                msg.destination, msg.max_hops
            );
            return Ok(RouteOutcome::Dropped);
        }
        msg.hop_count += 1;
        self.forward(msg).await
    }

    async fn forward(&self, msg: RoutedMessage) -> NetworkResult<RouteOutcome> {
        let entry = self.routes.read().await.get(&msg.destination).copied();
        let Some(entry) = entry else {
            return Err(NetworkError::Unroutable(format!("no route to {}", msg.destination)));
        };

        // Remaining hops after this send must fit the limit
        let remaining = entry.hop_count.saturating_sub(1);
        if msg.hop_count.saturating_add(remaining) > msg.max_hops {
            debug!(
                "Dropping message for {}: {} more hops exceed limit {}",
                msg.destination, entry.hop_count, msg.max_hops
            );
            return Ok(RouteOutcome::Dropped);
        }

        let next = self
            .directory
            .get(&entry.next_hop)
            .await
            .filter(|p| p.is_connected())
            .ok_or_else(|| NetworkError::Unroutable(format!("next hop {} not connected", entry.next_hop)))?;

        let local_id = *self.local_id.read().await;
        let envelope = Envelope::new(local_id, MessageBody::Routed(msg));
        let sent = timeout(self.config.send_timeout(), self.transport.send(next.info.addr, &envelope))
            .await
            .map_err(NetworkError::from)
            .and_then(|r| r);
        if let Err(e) = sent {
            warn!("Next hop {} unreachable: {}", entry.next_hop, e);
            self.directory.mark_disconnected(&entry.next_hop).await;
            return Err(e);
        }

        if entry.hop_count == 1 {
            Ok(RouteOutcome::Direct)
        } else {
            Ok(RouteOutcome::Forwarded {
                next_hop: entry.next_hop,
            })
        }
    }

    /// Abbreviated table for a neighbour (split horizon, shortest first)
    pub async fn adverts_for(&self, neighbour: PeerId) -> Vec<RouteAdvert> {
        let routes = self.routes.read().await;
        let mut adverts: Vec<RouteAdvert> = routes
            .iter()
            .filter(|(dest, entry)| **dest != neighbour && entry.next_hop != neighbour)
            .map(|(dest, entry)| RouteAdvert {
                destination: *dest,
                hops: entry.hop_count,
                latency_ms: entry.latency_ms,
            })
            .collect();
        adverts.sort_by_key(|a| (a.hops, a.latency_ms));
        adverts.truncate(self.config.max_routes_per_update);
        adverts
    }

    /// Send routing updates to all neighbours (best effort, unordered)
    pub async fn propagate(&self) -> usize {
        let neighbours: Vec<PeerId> = self
            .routes
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.hop_count == 1)
            .map(|(id, _)| *id)
            .collect();

        let local_id = *self.local_id.read().await;
        let mut sent = 0;
        for neighbour in neighbours {
            let Some(peer) = self.directory.get(&neighbour).await else {
                continue;
            };
            let routes = self.adverts_for(neighbour).await;
            let envelope = Envelope::new(local_id, MessageBody::RoutingUpdate { routes });
            match timeout(self.config.send_timeout(), self.transport.send(peer.info.addr, &envelope)).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => {
                    warn!("Routing update to {} failed: {}", neighbour, e);
                    self.directory.mark_disconnected(&neighbour).await;
                }
                Err(_) => warn!("Routing update to {} timed out", neighbour),
            }
        }
        sent
    }

    /// Drop learned routes that were not refreshed within the TTL
    pub async fn expire_stale(&self) -> usize {
        let ttl = self.config.route_ttl();
        let now = Instant::now();
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|_, e| e.hop_count == 1 || now.duration_since(e.last_update) < ttl);
        before - routes.len()
    }

    pub async fn route_to(&self, destination: &PeerId) -> Option<RoutingEntry> {
        self.routes.read().await.get(destination).copied()
    }

    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use crate::discovery::tests::{peer_info, FixedConnector, StaticBootstrap};
    use crate::discovery::{DiscoveryConfig, PeerEvent};
    use crate::transport::{InboundMessage, MemoryHub};
    use tokio::sync::mpsc;

    struct Fixture {
        router: MeshRouter,
        hub: MemoryHub,
        directory: Arc<PeerDirectory>,
        /// Inboxes of neighbours 1 and 2
        inboxes: HashMap<u8, mpsc::Receiver<InboundMessage>>,
    }

    async fn fixture(config: MeshConfig) -> Fixture {
        let hub = MemoryHub::new();
        let local_addr = SocketAddr::from(([10, 0, 0, 254], 7000));
        let (transport, _rx) = hub.endpoint(local_addr).await;

        let mut inboxes = HashMap::new();
        for n in [1u8, 2] {
            let (_t, rx) = hub.endpoint(peer_info(n).addr).await;
            inboxes.insert(n, rx);
        }

        let directory = PeerDirectory::new(
            peer_info(254),
            DiscoveryConfig::default(),
            transport.clone(),
            FixedConnector::ok(10),
            Arc::new(StaticBootstrap { peers: HashMap::new() }),
        );
        for n in [1u8, 2] {
            directory.add_peer(peer_info(n)).await;
            directory.connect_peer(PeerId([n; 32])).await.unwrap();
        }

        Fixture {
            router: MeshRouter::new(PeerId([254; 32]), config, transport, directory.clone()),
            hub,
            directory,
            inboxes,
        }
    }

    fn advert(n: u8, hops: u8) -> RouteAdvert {
        RouteAdvert {
            destination: PeerId([n; 32]),
            hops,
            latency_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_direct_route() {
        let mut f = fixture(MeshConfig::default()).await;
        f.router.on_peer_connected(PeerId([1; 32]), Duration::from_millis(10)).await;

        let outcome = f.router.route(PeerId([1; 32]), b"hi".to_vec()).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Direct);

        let inbox = f.inboxes.get_mut(&1).unwrap();
        // Routing update first, then the payload
        loop {
            let msg = inbox.recv().await.unwrap();
            if let MessageBody::Routed(routed) = msg.envelope.body {
                assert_eq!(routed.payload, b"hi".to_vec());
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_multi_hop_forwarding() {
        let f = fixture(MeshConfig::default()).await;
        f.router.on_peer_connected(PeerId([1; 32]), Duration::from_millis(10)).await;
        assert_eq!(f.router.handle_routing_update(PeerId([1; 32]), &[advert(9, 1)]).await, 1);

        let entry = f.router.route_to(&PeerId([9; 32])).await.unwrap();
        assert_eq!(entry.next_hop, PeerId([1; 32]));
        assert_eq!(entry.hop_count, 2);

        let outcome = f.router.route(PeerId([9; 32]), vec![1]).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded { next_hop: PeerId([1; 32]) });
    }

    #[tokio::test]
    async fn test_hop_limit_drops() {
        let config = MeshConfig {
            max_hops: 3,
            ..Default::default()
        };
        let f = fixture(config).await;
        f.router.on_peer_connected(PeerId([1; 32]), Duration::from_millis(10)).await;
        f.router.handle_routing_update(PeerId([1; 32]), &[advert(9, 2)]).await;

        let msg = RoutedMessage {
            destination: PeerId([9; 32]),
            source: PeerId([7; 32]),
            payload: vec![],
            hop_count: 3,
            max_hops: 3,
        };
        assert_eq!(f.router.handle_routed(msg).await.unwrap(), RouteOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_adverts_beyond_limit_ignored() {
        let config = MeshConfig {
            max_hops: 2,
            ..Default::default()
        };
        let f = fixture(config).await;
        f.router.on_peer_connected(PeerId([1; 32]), Duration::from_millis(10)).await;
        assert_eq!(f.router.handle_routing_update(PeerId([1; 32]), &[advert(9, 2)]).await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_prunes_transitively() {
        let f = fixture(MeshConfig::default()).await;
        f.router.on_peer_connected(PeerId([1; 32]), Duration::from_millis(10)).await;
        f.router.on_peer_connected(PeerId([2; 32]), Duration::from_millis(10)).await;
        f.router
            .handle_routing_update(PeerId([1; 32]), &[advert(8, 1), advert(9, 2)])
            .await;
        assert_eq!(f.router.route_count().await, 4);

        f.router.on_peer_disconnected(PeerId([1; 32])).await;
        assert_eq!(f.router.route_count().await, 1);
        assert!(f.router.route_to(&PeerId([9; 32])).await.is_none());
    }

    #[tokio::test]
    async fn test_delivered_locally() {
        let f = fixture(MeshConfig::default()).await;
        let msg = RoutedMessage {
            destination: PeerId([254; 32]),
            source: PeerId([7; 32]),
            payload: b"for me".to_vec(),
            hop_count: 2,
            max_hops: 6,
        };
        let outcome = f.router.handle_routed(msg).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Delivered {
                source: PeerId([7; 32]),
                payload: b"for me".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_update_from_stranger_ignored() {
        let f = fixture(MeshConfig::default()).await;
        assert_eq!(f.router.handle_routing_update(PeerId([5; 32]), &[advert(9, 1)]).await, 0);
    }

    #[tokio::test]
    async fn test_split_horizon() {
        let f = fixture(MeshConfig::default()).await;
        f.router.on_peer_connected(PeerId([1; 32]), Duration::from_millis(10)).await;
        f.router.on_peer_connected(PeerId([2; 32]), Duration::from_millis(10)).await;
        f.router.handle_routing_update(PeerId([1; 32]), &[advert(9, 1)]).await;

        let to_one = f.router.adverts_for(PeerId([1; 32])).await;
        assert!(to_one.iter().all(|a| a.destination != PeerId([9; 32])));
        let to_two = f.router.adverts_for(PeerId([2; 32])).await;
        assert!(to_two.iter().any(|a| a.destination == PeerId([9; 32])));
    }

    #[tokio::test]
    async fn test_reset_keeps_neighbours() {
        let f = fixture(MeshConfig::default()).await;
        f.router.on_peer_connected(PeerId([1; 32]), Duration::from_millis(10)).await;
        f.router.handle_routing_update(PeerId([1; 32]), &[advert(9, 1)]).await;
        assert_eq!(f.router.route_count().await, 2);

        f.router.reset(PeerId([200; 32])).await;
        assert_eq!(f.router.route_count().await, 1);
        assert!(f.router.route_to(&PeerId([9; 32])).await.is_none());

        let outcome = f.router.route(PeerId([1; 32]), b"after".to_vec()).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Direct);
        // Neighbours can still teach us routes
        assert_eq!(f.router.handle_routing_update(PeerId([1; 32]), &[advert(9, 1)]).await, 1);
    }

    #[tokio::test]
    async fn test_send_failure_marks_next_hop_down() {
        let f = fixture(MeshConfig::default()).await;
        let mut events = f.directory.subscribe();
        f.router.on_peer_connected(PeerId([1; 32]), Duration::from_millis(10)).await;

        f.hub.disconnect(&peer_info(1).addr).await;
        assert!(f.router.route(PeerId([1; 32]), vec![1]).await.is_err());

        assert!(!f.directory.get(&PeerId([1; 32])).await.unwrap().is_connected());
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Disconnected { peer_id: PeerId([1; 32]) }
        );
    }
}
