//! Generic P2P Relay
//!
//! Relays traffic between two NATed peers when direct connection and hole
//! punching both failed. A relay is any connected peer that advertises the
//! `relay` capability, which peers only do after classifying their own NAT
//! as open or cone and measuring acceptable latency (see
//! [`is_relay_eligible`]).
//!
//! Sessions that stay `Connecting` past the connect timeout or relay more
//! than the bandwidth cap are closed by [`RelayManager::monitor`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::discovery::PeerDirectory;
use crate::error::{NetworkError, NetworkResult};
use crate::protocol::{Envelope, MessageBody, NatType, PeerId, PeerInfo, RoutedMessage};
use crate::transport::PeerTransport;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum concurrent relay sessions
    pub max_sessions: usize,
    /// Sessions still connecting after this are terminated (milliseconds)
    pub connect_timeout_ms: u64,
    /// Per-session byte ceiling
    pub bandwidth_cap_bytes: u64,
    /// Highest latency at which we offer to relay for others (milliseconds)
    pub max_relay_latency_ms: u64,
    /// Interval between monitor passes (seconds)
    pub monitor_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            connect_timeout_ms: 10_000,
            bandwidth_cap_bytes: 100 * 1024 * 1024,
            max_relay_latency_ms: 250,
            monitor_interval_secs: 10,
        }
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn max_relay_latency(&self) -> Duration {
        Duration::from_millis(self.max_relay_latency_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bandwidth_cap_bytes == 0 {
            return Err("bandwidth_cap_bytes must be non-zero".into());
        }
        if self.connect_timeout_ms == 0 {
            return Err("connect_timeout_ms must be non-zero".into());
        }
        Ok(())
    }
}

/// Whether this node should advertise itself as a relay
pub fn is_relay_eligible(nat_type: NatType, latency: Option<Duration>, config: &RelayConfig) -> bool {
    let open = matches!(nat_type, NatType::None | NatType::Cone);
    let fast = latency
        .map(|l| l <= config.max_relay_latency())
        .unwrap_or(false);
    open && fast
}

/// Relay session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelaySessionState {
    Connecting,
    Connected,
    Closed,
}

/// Why a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayCloseReason {
    ConnectTimeout,
    BandwidthExceeded,
    NegotiationFailed,
    Requested,
}

impl std::fmt::Display for RelayCloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RelayCloseReason::ConnectTimeout => "connect timeout",
            RelayCloseReason::BandwidthExceeded => "bandwidth cap exceeded",
            RelayCloseReason::NegotiationFailed => "negotiation failed",
            RelayCloseReason::Requested => "closed by owner",
        };
        f.write_str(s)
    }
}

/// Relay session bookkeeping
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub id: u64,
    pub local: PeerId,
    pub remote: PeerId,
    /// Chosen relay node
    pub relay: PeerInfo,
    pub bytes_relayed: u64,
    pub state: RelaySessionState,
    pub started_at: Instant,
}

/// Relay notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Established { session_id: u64, relay: PeerId },
    Closed { session_id: u64, reason: RelayCloseReason },
}

/// Negotiates and carries relayed traffic through a relay node
#[async_trait]
pub trait RelayNegotiator: Send + Sync {
    async fn negotiate(&self, relay: &PeerInfo, local: &PeerInfo, remote: &PeerInfo) -> NetworkResult<()>;

    async fn forward(&self, session: &RelaySession, data: &[u8]) -> NetworkResult<()>;
}

/// Relays through the mesh transport as two-hop routed messages; the relay
/// node's mesh router forwards them to the remote peer.
pub struct TransportNegotiator {
    transport: Arc<dyn PeerTransport>,
}

impl TransportNegotiator {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }

    fn routed(local: PeerId, remote: PeerId, payload: Vec<u8>) -> Envelope {
        Envelope::new(
            local,
            MessageBody::Routed(RoutedMessage {
                destination: remote,
                source: local,
                payload,
                hop_count: 1,
                max_hops: 2,
            }),
        )
    }
}

#[async_trait]
impl RelayNegotiator for TransportNegotiator {
    async fn negotiate(&self, relay: &PeerInfo, local: &PeerInfo, remote: &PeerInfo) -> NetworkResult<()> {
        // Empty routed payload opens the path on the relay
        let hello = Self::routed(local.peer_id, remote.peer_id, Vec::new());
        self.transport.send(relay.addr, &hello).await
    }

    async fn forward(&self, session: &RelaySession, data: &[u8]) -> NetworkResult<()> {
        let msg = Self::routed(session.local, session.remote, data.to_vec());
        self.transport.send(session.relay.addr, &msg).await
    }
}

/// Generic relay manager
pub struct RelayManager {
    config: RelayConfig,
    directory: Arc<PeerDirectory>,
    negotiator: Arc<dyn RelayNegotiator>,
    sessions: RwLock<HashMap<u64, RelaySession>>,
    next_id: AtomicU64,
    total_bytes: AtomicU64,
    events: broadcast::Sender<RelayEvent>,
}

impl RelayManager {
    pub fn new(
        config: RelayConfig,
        directory: Arc<PeerDirectory>,
        negotiator: Arc<dyn RelayNegotiator>,
    ) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            config,
            directory,
            negotiator,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            total_bytes: AtomicU64::new(0),
            events,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Open a relayed path between `local` and `remote`.
    ///
    /// Relay candidates are tried lowest latency first; the first that
    /// negotiates within the connect timeout carries the session.
    pub async fn establish_relay_connection(
        &self,
        local: &PeerInfo,
        remote: &PeerInfo,
    ) -> NetworkResult<u64> {
        let candidates: Vec<PeerInfo> = self
            .directory
            .relay_candidates()
            .await
            .into_iter()
            .map(|(info, _)| info)
            .filter(|info| info.peer_id != local.peer_id && info.peer_id != remote.peer_id)
            .collect();

        let first = candidates.first().cloned().ok_or(NetworkError::NoRelayAvailable)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.write().await;
            let active = sessions
                .values()
                .filter(|s| s.state != RelaySessionState::Closed)
                .count();
            if active >= self.config.max_sessions {
                return Err(NetworkError::ResourceExhausted(format!(
                    "relay sessions at limit ({})",
                    self.config.max_sessions
                )));
            }
            sessions.insert(
                id,
                RelaySession {
                    id,
                    local: local.peer_id,
                    remote: remote.peer_id,
                    relay: first,
                    bytes_relayed: 0,
                    state: RelaySessionState::Connecting,
                    started_at: Instant::now(),
                },
            );
        }

        for relay in candidates {
            // Keep the session pointing at the relay being negotiated
            match self.sessions.write().await.get_mut(&id) {
                Some(session) => session.relay = relay.clone(),
                None => return Err(NetworkError::Cancelled),
            }

            let result = timeout(
                self.config.connect_timeout(),
                self.negotiator.negotiate(&relay, local, remote),
            )
            .await
            .map_err(NetworkError::from)
            .and_then(|r| r);

            match result {
                Ok(()) => {
                    let mut sessions = self.sessions.write().await;
                    let Some(session) = sessions.get_mut(&id) else {
                        // Monitor closed it while we negotiated
                        return Err(NetworkError::Cancelled);
                    };
                    session.state = RelaySessionState::Connected;
                    info!(
                        "Relay session {} established: {} -> {} via {}",
                        id, local.peer_id, remote.peer_id, relay.peer_id
                    );
                    let _ = self.events.send(RelayEvent::Established {
                        session_id: id,
                        relay: relay.peer_id,
                    });
                    return Ok(id);
                }
                Err(e) => {
                    warn!("Relay negotiation via {} failed: {}", relay.peer_id, e);
                }
            }
        }

        self.close_session(id, RelayCloseReason::NegotiationFailed).await;
        Err(NetworkError::NoRelayAvailable)
    }

    /// Forward bytes over an established session
    pub async fn relay_data(&self, session_id: u64, data: &[u8]) -> NetworkResult<()> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&session_id)
                .cloned()
                .ok_or(NetworkError::SessionNotFound(session_id))?
        };
        if session.state != RelaySessionState::Connected {
            return Err(NetworkError::SessionNotConnected(session_id));
        }

        timeout(self.config.connect_timeout(), self.negotiator.forward(&session, data)).await??;

        let len = data.len() as u64;
        if let Some(s) = self.sessions.write().await.get_mut(&session_id) {
            s.bytes_relayed += len;
        }
        self.total_bytes.fetch_add(len, Ordering::Relaxed);
        trace!("Relayed {} bytes on session {}", len, session_id);
        Ok(())
    }

    /// Terminate sessions over the connect timeout or bandwidth cap.
    ///
    /// Returns the sessions closed by this pass.
    pub async fn monitor(&self) -> Vec<(u64, RelayCloseReason)> {
        let now = Instant::now();
        let connect_timeout = self.config.connect_timeout();
        let cap = self.config.bandwidth_cap_bytes;

        let closed: Vec<(u64, RelayCloseReason)> = {
            let mut sessions = self.sessions.write().await;
            let doomed: Vec<(u64, RelayCloseReason)> = sessions
                .values()
                .filter_map(|s| {
                    if s.state == RelaySessionState::Connecting
                        && now.duration_since(s.started_at) > connect_timeout
                    {
                        Some((s.id, RelayCloseReason::ConnectTimeout))
                    } else if s.bytes_relayed > cap {
                        Some((s.id, RelayCloseReason::BandwidthExceeded))
                    } else {
                        None
                    }
                })
                .collect();
            for (id, _) in &doomed {
                sessions.remove(id);
            }
            doomed
        };

        for (id, reason) in &closed {
            info!("Relay session {} terminated: {}", id, reason);
            let _ = self.events.send(RelayEvent::Closed {
                session_id: *id,
                reason: *reason,
            });
        }
        if !closed.is_empty() {
            debug!("Relay monitor closed {} sessions", closed.len());
        }
        closed
    }

    /// Close a session on request
    pub async fn close_session(&self, session_id: u64, reason: RelayCloseReason) -> bool {
        let removed = self.sessions.write().await.remove(&session_id).is_some();
        if removed {
            debug!("Relay session {} closed: {}", session_id, reason);
            let _ = self.events.send(RelayEvent::Closed { session_id, reason });
        }
        removed
    }

    pub async fn session(&self, session_id: u64) -> Option<RelaySession> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn total_bytes_relayed(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}
