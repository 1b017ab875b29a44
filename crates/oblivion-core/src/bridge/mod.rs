//! Bridge relays
//!
//! Bridges are unlisted entry relays reached through pluggable transports.
//! The pool merges builtin bridges with advertisements fetched from the
//! DHT, ranks them by measured latency and evicts bridges whose
//! consecutive failures pass the configured threshold. Evicted bridges
//! leave the pool, freeing their slot for a replacement, and are
//! remembered in a bounded denylist so re-advertising them has no effect.
//!
//! Lock order: pool → denylist → sessions.

pub mod session;
pub mod transport;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oblivion_dht::{keys, DhtStore};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::directory::{RelayDescriptor, RelayFlags};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, OverlayEvent};

pub use session::{BridgeSession, SessionCloseReason};
pub use transport::{
    PluggableTransport, TcpReachTransport, TransportConnection, TransportKind, TransportRegistry,
};

/// Country reported for bridges that do not publish one
pub const UNKNOWN_COUNTRY: &str = "??";

/// Bridge descriptor as configured or advertised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeDescriptor {
    /// Transport name (obfs4, snowflake, meek, webtunnel)
    #[serde(rename = "type")]
    pub transport: String,
    /// `host:port`
    pub address: String,
    /// Hex fingerprint
    pub fingerprint: String,
    /// Transport-specific fields (cert, iat-mode, url, front, ...)
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: i32,
}

impl BridgeDescriptor {
    fn is_well_formed(&self) -> bool {
        !self.address.is_empty()
            && !self.fingerprint.is_empty()
            && hex::decode(&self.fingerprint).is_ok()
    }

    /// A transport field as text; numbers and booleans are rendered
    pub fn param(&self, key: &str) -> Option<String> {
        match self.params.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Where a bridge came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSource {
    Builtin,
    Fetched,
}

/// A bridge in the pool with its health record
#[derive(Debug, Clone)]
pub struct Bridge {
    pub descriptor: BridgeDescriptor,
    pub source: BridgeSource,
    pub latency: Option<Duration>,
    /// Consecutive failures
    pub failures: u32,
    pub last_tested: Option<Instant>,
    /// Address the transport last reached
    pub resolved: Option<SocketAddr>,
}

impl Bridge {
    fn new(descriptor: BridgeDescriptor, source: BridgeSource) -> Self {
        Self {
            descriptor,
            source,
            latency: None,
            failures: 0,
            last_tested: None,
            resolved: None,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.descriptor.fingerprint
    }

    /// Relay descriptor for use as a circuit entry
    pub fn as_entry_relay(&self) -> Option<RelayDescriptor> {
        let address = self
            .resolved
            .or_else(|| self.descriptor.address.parse().ok())?;
        let country = self
            .descriptor
            .param("country")
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
        Some(RelayDescriptor {
            fingerprint: self.descriptor.fingerprint.clone(),
            address,
            country,
            bandwidth: 0,
            flags: RelayFlags {
                guard: true,
                ..Default::default()
            },
        })
    }
}

/// Outcome of one health check pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub tested: usize,
    pub healthy: usize,
    pub evicted: usize,
}

/// Bridge pool and sessions
pub struct BridgeManager {
    config: BridgeConfig,
    registry: TransportRegistry,
    builtin: Vec<BridgeDescriptor>,
    dht: Option<Arc<DhtStore>>,
    /// Active bridges only
    pool: RwLock<HashMap<String, Bridge>>,
    /// Fingerprints of evicted bridges
    denylist: Mutex<LruCache<String, ()>>,
    sessions: RwLock<HashMap<u64, BridgeSession>>,
    next_session: AtomicU64,
    events: EventBus,
}

impl BridgeManager {
    pub fn new(
        config: BridgeConfig,
        registry: TransportRegistry,
        builtin: Vec<BridgeDescriptor>,
        dht: Option<Arc<DhtStore>>,
        events: EventBus,
    ) -> Self {
        let denylist = NonZeroUsize::new(config.max_evicted).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            registry,
            builtin,
            dht,
            pool: RwLock::new(HashMap::new()),
            denylist: Mutex::new(LruCache::new(denylist)),
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            events,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Merge builtin bridges with advertisements from the DHT.
    ///
    /// Returns the number of active (non-evicted) bridges afterwards.
    pub async fn discover_bridges(&self) -> usize {
        let mut found: Vec<(BridgeDescriptor, BridgeSource)> = self
            .builtin
            .iter()
            .cloned()
            .map(|d| (d, BridgeSource::Builtin))
            .collect();

        if let Some(dht) = &self.dht {
            for transport in &self.config.enabled_transports {
                let key = keys::bridges(transport);
                match dht.retrieve(&key).await {
                    Ok(Some(bytes)) => match serde_json::from_slice::<Vec<BridgeDescriptor>>(&bytes) {
                        Ok(list) => {
                            debug!("{} bridges advertised under '{}'", list.len(), key);
                            found.extend(list.into_iter().map(|d| (d, BridgeSource::Fetched)));
                        }
                        Err(e) => warn!("Malformed bridge advertisement '{}': {}", key, e),
                    },
                    Ok(None) => {}
                    Err(e) => debug!("Bridge lookup '{}' failed: {}", key, e),
                }
            }
        }

        let mut pool = self.pool.write().await;
        let denylist = self.denylist.lock().await;
        let mut added = 0;
        for (descriptor, source) in found {
            if !descriptor.is_well_formed() {
                debug!("Skipping malformed bridge {:?}", descriptor.address);
                continue;
            }
            if denylist.contains(&descriptor.fingerprint) {
                continue;
            }
            if let Some(existing) = pool.get_mut(&descriptor.fingerprint) {
                existing.descriptor = descriptor;
                continue;
            }
            if pool.len() >= self.config.max_pool_size {
                debug!("Bridge pool full ({})", self.config.max_pool_size);
                break;
            }
            pool.insert(descriptor.fingerprint.clone(), Bridge::new(descriptor, source));
            added += 1;
        }

        let active = pool.len();
        if added > 0 {
            info!("Discovered {} new bridges ({} active)", added, active);
        }
        active
    }

    /// Advertise bridges for `transport` in the DHT
    pub async fn publish_bridges(
        &self,
        transport: &str,
        bridges: &[BridgeDescriptor],
        ttl: Duration,
    ) -> CoreResult<usize> {
        let dht = self
            .dht
            .as_ref()
            .ok_or_else(|| CoreError::ConfigError("no DHT attached".into()))?;
        let value = serde_json::to_vec(bridges)?;
        let (_, replicated) = dht.store(&keys::bridges(transport), value, ttl).await?;
        Ok(replicated)
    }

    /// Test one bridge through its transport, recording the outcome
    pub async fn test_bridge(&self, fingerprint: &str) -> CoreResult<Duration> {
        let descriptor = self.active_descriptor(fingerprint).await?;
        match self.registry.connect(&descriptor, self.config.test_timeout()).await {
            Ok(conn) => {
                self.record_success(fingerprint, &conn).await;
                Ok(conn.latency)
            }
            Err(e) => {
                self.record_failure(fingerprint).await;
                Err(e)
            }
        }
    }

    async fn active_descriptor(&self, fingerprint: &str) -> CoreResult<BridgeDescriptor> {
        if let Some(bridge) = self.pool.read().await.get(fingerprint) {
            return Ok(bridge.descriptor.clone());
        }
        if self.is_evicted(fingerprint).await {
            Err(CoreError::BridgeUnreachable(format!("{} is evicted", fingerprint)))
        } else {
            Err(CoreError::BridgeUnreachable(format!("{} is unknown", fingerprint)))
        }
    }

    async fn record_success(&self, fingerprint: &str, conn: &TransportConnection) {
        if let Some(bridge) = self.pool.write().await.get_mut(fingerprint) {
            bridge.latency = Some(conn.latency);
            bridge.failures = 0;
            bridge.last_tested = Some(Instant::now());
            bridge.resolved = Some(conn.remote);
        }
    }

    /// Count a failure; returns true if this evicted the bridge
    pub async fn record_failure(&self, fingerprint: &str) -> bool {
        let failures = {
            let mut pool = self.pool.write().await;
            let Some(bridge) = pool.get_mut(fingerprint) else {
                return false;
            };
            bridge.failures += 1;
            bridge.last_tested = Some(Instant::now());
            if bridge.failures <= self.config.max_failures {
                debug!("Bridge {} failure {}", fingerprint, bridge.failures);
                return false;
            }
            let failures = bridge.failures;
            pool.remove(fingerprint);
            self.denylist.lock().await.put(fingerprint.to_string(), ());
            failures
        };

        warn!("Evicted bridge {} after {} consecutive failures", fingerprint, failures);
        self.events.publish(OverlayEvent::BridgeEvicted {
            fingerprint: fingerprint.to_string(),
            failures,
        });

        let orphaned: Vec<u64> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.fingerprint == fingerprint)
            .map(|s| s.id)
            .collect();
        for id in orphaned {
            self.close_session(id, SessionCloseReason::BridgeEvicted).await;
        }
        true
    }

    /// Test up to `batch` active bridges concurrently, least recently
    /// tested first
    pub async fn health_check(self: &Arc<Self>, batch: usize) -> HealthReport {
        let mut due: Vec<(String, Option<Instant>)> = self
            .pool
            .read()
            .await
            .values()
            .map(|b| (b.descriptor.fingerprint.clone(), b.last_tested))
            .collect();
        due.sort_by_key(|(_, tested)| *tested);
        due.truncate(batch);

        let mut set = JoinSet::new();
        for (fingerprint, _) in due {
            let manager = self.clone();
            set.spawn(async move {
                let result = manager.test_bridge(&fingerprint).await;
                (fingerprint, result)
            });
        }

        let mut report = HealthReport::default();
        while let Some(joined) = set.join_next().await {
            let Ok((fingerprint, result)) = joined else {
                continue;
            };
            report.tested += 1;
            match result {
                Ok(_) => report.healthy += 1,
                Err(e) => {
                    debug!("Bridge {} health check failed: {}", fingerprint, e);
                    if self.is_evicted(&fingerprint).await {
                        report.evicted += 1;
                    }
                }
            }
        }

        if report.tested > 0 {
            info!(
                "Bridge health check: {}/{} healthy, {} evicted",
                report.healthy, report.tested, report.evicted
            );
        }
        report
    }

    pub async fn is_evicted(&self, fingerprint: &str) -> bool {
        self.denylist.lock().await.contains(fingerprint)
    }

    /// Up to `n` active bridges, lowest latency first; untested bridges
    /// rank after measured ones
    pub async fn get_best_bridges(&self, n: usize) -> Vec<Bridge> {
        let mut active: Vec<Bridge> = self
            .pool
            .read()
            .await
            .values()
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            let rank = |x: &Bridge| (x.latency.is_none(), x.latency, -x.descriptor.priority);
            rank(a).cmp(&rank(b))
        });
        active.truncate(n);
        active
    }

    /// Entry relays for bridge-only circuits
    pub async fn entry_relays(&self, n: usize) -> Vec<RelayDescriptor> {
        self.get_best_bridges(n)
            .await
            .iter()
            .filter_map(Bridge::as_entry_relay)
            .collect()
    }

    fn session_limit(&self) -> CoreError {
        CoreError::ResourceExhausted(format!(
            "bridge session limit {} reached",
            self.config.max_sessions
        ))
    }

    /// Open a session through the bridge's transport
    pub async fn connect_to_bridge(&self, fingerprint: &str) -> CoreResult<u64> {
        // Cheap early refusal; the limit is enforced again at insert
        if self.sessions.read().await.len() >= self.config.max_sessions {
            return Err(self.session_limit());
        }

        let descriptor = self.active_descriptor(fingerprint).await?;
        let conn = match self.registry.connect(&descriptor, self.config.test_timeout()).await {
            Ok(conn) => conn,
            Err(e) => {
                self.record_failure(fingerprint).await;
                return Err(e);
            }
        };
        self.record_success(fingerprint, &conn).await;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.config.max_sessions {
                return Err(self.session_limit());
            }
            sessions.insert(id, BridgeSession::new(id, fingerprint, conn.kind, conn.remote));
        }
        info!("Bridge session {} via {} {}", id, conn.kind, conn.remote);
        Ok(id)
    }

    /// Account bytes carried by a session
    pub async fn relay(&self, session_id: u64, bytes: usize) -> CoreResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(CoreError::SessionNotFound(session_id))?;
        session.record(bytes);
        Ok(())
    }

    pub async fn close_session(&self, session_id: u64, reason: SessionCloseReason) -> bool {
        let removed = self.sessions.write().await.remove(&session_id).is_some();
        if removed {
            debug!("Closed bridge session {}: {}", session_id, reason);
            self.events.publish(OverlayEvent::BridgeSessionClosed {
                session_id,
                reason: reason.to_string(),
            });
        }
        removed
    }

    pub async fn close_all_sessions(&self, reason: SessionCloseReason) -> usize {
        let ids: Vec<u64> = self.sessions.read().await.keys().copied().collect();
        let mut closed = 0;
        for id in ids {
            if self.close_session(id, reason).await {
                closed += 1;
            }
        }
        closed
    }

    /// Tear down sessions past the bandwidth cap or idle timeout
    pub async fn monitor_sessions(&self) -> Vec<(u64, SessionCloseReason)> {
        let breached: Vec<(u64, SessionCloseReason)> = self
            .sessions
            .read()
            .await
            .values()
            .filter_map(|s| {
                s.breach(
                    self.config.session_bandwidth_cap_bytes,
                    self.config.session_idle_timeout(),
                )
                .map(|reason| (s.id, reason))
            })
            .collect();

        for (id, reason) in &breached {
            warn!("Bridge session {} torn down: {}", id, reason);
            self.close_session(*id, *reason).await;
        }
        breached
    }

    pub async fn bridge(&self, fingerprint: &str) -> Option<Bridge> {
        self.pool.read().await.get(fingerprint).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.pool.read().await.len()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
