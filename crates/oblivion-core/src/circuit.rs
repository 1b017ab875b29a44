//! Circuit Management
//!
//! A circuit is a fixed guard → middle → exit path. Hops are extended
//! strictly in order inside the task that builds the circuit; destroying a
//! circuit cancels a build that is still in flight.
//!
//! Lock order: circuits map → individual circuit. Streams live inside the
//! circuit they are attached to.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::CircuitConfig;
use crate::directory::{RelayDescriptor, RelayDirectory};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, OverlayEvent};
use crate::path::PathSelector;

/// Circuit identifier (random 32-bit value)
pub type CircuitId = u32;

/// Logical stream identifier
pub type StreamId = u32;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Hops are being extended
    Building,
    /// Ready for traffic
    Ready,
    /// Usable but scheduled for replacement
    Degraded,
    /// Terminal
    Destroyed,
}

/// What a circuit is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitPurpose {
    General,
    Introduction,
    Onion,
    HsDir,
}

impl std::fmt::Display for CircuitPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitPurpose::General => "general",
            CircuitPurpose::Introduction => "introduction",
            CircuitPurpose::Onion => "onion",
            CircuitPurpose::HsDir => "hsdir",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CircuitPurpose {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "general" => Ok(CircuitPurpose::General),
            "introduction" => Ok(CircuitPurpose::Introduction),
            "onion" => Ok(CircuitPurpose::Onion),
            "hsdir" => Ok(CircuitPurpose::HsDir),
            other => Err(CoreError::ConfigError(format!("unknown circuit purpose '{}'", other))),
        }
    }
}

/// Hop position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopRole {
    Guard,
    Middle,
    Exit,
}

/// A single hop in the circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitHop {
    pub role: HopRole,
    pub fingerprint: String,
    pub address: SocketAddr,
    pub country: String,
    pub bandwidth: u64,
}

impl CircuitHop {
    fn from_relay(role: HopRole, relay: &RelayDescriptor) -> Self {
        Self {
            role,
            fingerprint: relay.fingerprint.clone(),
            address: relay.address,
            country: relay.country.clone(),
            bandwidth: relay.bandwidth,
        }
    }
}

/// A circuit through the overlay
#[derive(Debug, Clone)]
pub struct Circuit {
    id: CircuitId,
    purpose: CircuitPurpose,
    state: CircuitState,
    /// Completed hops, guard first
    hops: Vec<CircuitHop>,
    created_at: Instant,
    streams: HashSet<StreamId>,
}

impl Circuit {
    pub fn new(id: CircuitId, purpose: CircuitPurpose) -> Self {
        Self {
            id,
            purpose,
            state: CircuitState::Building,
            hops: Vec::with_capacity(crate::CIRCUIT_LENGTH),
            created_at: Instant::now(),
            streams: HashSet::new(),
        }
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn purpose(&self) -> CircuitPurpose {
        self.purpose
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn set_state(&mut self, state: CircuitState) {
        debug!("Circuit {} state: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state == CircuitState::Ready
    }

    pub fn hops(&self) -> &[CircuitHop] {
        &self.hops
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn exit_hop(&self) -> Option<&CircuitHop> {
        self.hops.last()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamId> {
        self.streams.iter()
    }
}

/// Extends circuits hop by hop.
///
/// This is where a real relay handshake (ntor) plugs in.
#[async_trait]
pub trait HopConnector: Send + Sync {
    /// Extend `circuit_id` to `hop`, through `previous` when there is one
    async fn extend(
        &self,
        circuit_id: CircuitId,
        hop: &CircuitHop,
        previous: Option<&CircuitHop>,
    ) -> CoreResult<()>;

    /// Close one stream on the circuit
    async fn close_stream(&self, circuit_id: CircuitId, stream_id: StreamId);

    /// Tear down whatever was established for the circuit
    async fn teardown(&self, circuit_id: CircuitId);
}

/// Reaches the guard over TCP; later extensions are relayed through it and
/// carry no handshake of their own yet.
pub struct TcpHopConnector;

#[async_trait]
impl HopConnector for TcpHopConnector {
    async fn extend(
        &self,
        circuit_id: CircuitId,
        hop: &CircuitHop,
        previous: Option<&CircuitHop>,
    ) -> CoreResult<()> {
        if previous.is_none() {
            TcpStream::connect(hop.address)
                .await
                .map_err(|e| CoreError::CircuitBuildFailed(format!("guard {}: {}", hop.address, e)))?;
        }
        debug!("Circuit {} extended to {:?} {}", circuit_id, hop.role, hop.fingerprint);
        Ok(())
    }

    async fn close_stream(&self, circuit_id: CircuitId, stream_id: StreamId) {
        debug!("Circuit {} closed stream {}", circuit_id, stream_id);
    }

    async fn teardown(&self, _circuit_id: CircuitId) {}
}

/// Circuit counts for status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub building: usize,
    pub ready: usize,
    pub degraded: usize,
    pub streams: usize,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitMaintenance {
    pub destroyed: usize,
    pub built: usize,
    pub failed: usize,
}

/// Manager for multiple circuits
pub struct CircuitManager {
    config: CircuitConfig,
    relays: Arc<RelayDirectory>,
    connector: Arc<dyn HopConnector>,
    circuits: RwLock<HashMap<CircuitId, Arc<RwLock<Circuit>>>>,
    /// Cancel signals for builds in flight
    cancels: Mutex<HashMap<CircuitId, watch::Sender<bool>>>,
    /// Entry relays used instead of public guards (bridge mode)
    entry_guards: RwLock<Option<Vec<RelayDescriptor>>>,
    next_stream: AtomicU32,
    events: EventBus,
}

impl CircuitManager {
    pub fn new(
        config: CircuitConfig,
        relays: Arc<RelayDirectory>,
        connector: Arc<dyn HopConnector>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            relays,
            connector,
            circuits: RwLock::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            entry_guards: RwLock::new(None),
            next_stream: AtomicU32::new(1),
            events,
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Restrict (or stop restricting) circuit entry to the given relays
    pub async fn set_entry_guards(&self, guards: Option<Vec<RelayDescriptor>>) {
        match &guards {
            Some(g) => info!("Circuit entry restricted to {} bridges", g.len()),
            None => info!("Circuit entry through public guards"),
        }
        *self.entry_guards.write().await = guards;
    }

    pub async fn bridges_only(&self) -> bool {
        self.entry_guards.read().await.is_some()
    }

    /// Build a circuit, retrying failed builds with exponential backoff
    pub async fn create_circuit(
        &self,
        purpose: CircuitPurpose,
        exit_override: Option<&str>,
    ) -> CoreResult<CircuitId> {
        let mut backoff = self.config.build_backoff();
        let mut attempt = 0;
        loop {
            match self.build_once(purpose, exit_override).await {
                Ok(id) => return Ok(id),
                Err(e @ CoreError::CircuitBuildFailed(_)) | Err(e @ CoreError::Timeout)
                    if attempt < self.config.build_retries =>
                {
                    attempt += 1;
                    debug!(
                        "{} circuit build failed ({}), retry {} in {:?}",
                        purpose, e, attempt, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn build_once(
        &self,
        purpose: CircuitPurpose,
        exit_override: Option<&str>,
    ) -> CoreResult<CircuitId> {
        let live = self.count().await;
        if live >= self.config.max_circuits {
            return Err(CoreError::ResourceExhausted(format!(
                "circuit limit {} reached",
                self.config.max_circuits
            )));
        }

        let relays = self.relays.snapshot().await;
        let entry_guards = self.entry_guards.read().await.clone();
        let path = PathSelector::new()
            .preferred_exit_countries(&self.config.preferred_exit_countries)
            .exit_override(exit_override)
            .entry_guards(entry_guards)
            .select_path(&relays)?;

        let (id, circuit, mut cancel_rx) = self.register(purpose).await?;

        let plan = [
            CircuitHop::from_relay(HopRole::Guard, &path.guard),
            CircuitHop::from_relay(HopRole::Middle, &path.middle),
            CircuitHop::from_relay(HopRole::Exit, &path.exit),
        ];

        let mut previous: Option<&CircuitHop> = None;
        for hop in plan.iter() {
            let step = timeout(
                self.config.hop_timeout(),
                self.connector.extend(id, hop, previous),
            );
            let result = tokio::select! {
                r = step => r.map_err(CoreError::from).and_then(|r| r),
                _ = cancel_rx.changed() => Err(CoreError::Cancelled),
            };

            if let Err(e) = result {
                self.cancels.lock().await.remove(&id);
                if matches!(e, CoreError::Cancelled) {
                    debug!("Circuit {} build cancelled", id);
                    return Err(e);
                }
                warn!("Circuit {} failed at {:?} hop: {}", id, hop.role, e);
                self.discard(id, &format!("build failed: {}", e)).await;
                return Err(match e {
                    CoreError::Timeout => CoreError::CircuitBuildFailed(format!(
                        "{:?} hop {} timed out",
                        hop.role, hop.fingerprint
                    )),
                    other => other,
                });
            }

            circuit.write().await.hops.push(hop.clone());
            previous = Some(hop);
        }

        self.cancels.lock().await.remove(&id);
        {
            let mut c = circuit.write().await;
            // Destroyed while the last hop was completing
            if c.state() != CircuitState::Building {
                return Err(CoreError::Cancelled);
            }
            c.set_state(CircuitState::Ready);
        }

        info!("Built {} circuit {} ({} hops)", purpose, id, plan.len());
        self.events.publish(OverlayEvent::CircuitBuilt {
            circuit_id: id,
            purpose,
        });
        Ok(id)
    }

    /// Insert a fresh Building circuit with a cancel signal
    async fn register(
        &self,
        purpose: CircuitPurpose,
    ) -> CoreResult<(CircuitId, Arc<RwLock<Circuit>>, watch::Receiver<bool>)> {
        let mut circuits = self.circuits.write().await;
        if circuits.len() >= self.config.max_circuits {
            return Err(CoreError::ResourceExhausted(format!(
                "circuit limit {} reached",
                self.config.max_circuits
            )));
        }

        let mut id: CircuitId = rand::random();
        while id == 0 || circuits.contains_key(&id) {
            id = rand::random();
        }

        let circuit = Arc::new(RwLock::new(Circuit::new(id, purpose)));
        circuits.insert(id, circuit.clone());

        let (tx, rx) = watch::channel(false);
        self.cancels.lock().await.insert(id, tx);
        Ok((id, circuit, rx))
    }

    /// Remove a failed build without the stream teardown of a live circuit
    async fn discard(&self, id: CircuitId, reason: &str) {
        let removed = self.circuits.write().await.remove(&id);
        if let Some(circuit) = removed {
            circuit.write().await.set_state(CircuitState::Destroyed);
            self.connector.teardown(id).await;
            self.events.publish(OverlayEvent::CircuitDestroyed {
                circuit_id: id,
                reason: reason.to_string(),
            });
        }
    }

    /// Get a circuit by ID
    pub async fn get(&self, id: CircuitId) -> Option<Arc<RwLock<Circuit>>> {
        self.circuits.read().await.get(&id).cloned()
    }

    /// Ready circuit of `purpose` carrying the fewest streams
    pub async fn get_best_circuit(&self, purpose: CircuitPurpose) -> Option<CircuitId> {
        let circuits = self.circuits.read().await;
        let mut best: Option<(CircuitId, usize)> = None;
        for circuit in circuits.values() {
            let c = circuit.read().await;
            if c.purpose() != purpose || !c.is_ready() {
                continue;
            }
            if best.map_or(true, |(_, streams)| c.stream_count() < streams) {
                best = Some((c.id(), c.stream_count()));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Destroy a circuit, closing its streams and cancelling an in-flight
    /// build
    pub async fn destroy_circuit(&self, id: CircuitId, reason: &str) -> CoreResult<()> {
        let circuit = self
            .circuits
            .write()
            .await
            .remove(&id)
            .ok_or(CoreError::CircuitNotFound(id))?;

        if let Some(cancel) = self.cancels.lock().await.remove(&id) {
            let _ = cancel.send(true);
        }

        let streams: Vec<StreamId> = {
            let mut c = circuit.write().await;
            c.set_state(CircuitState::Destroyed);
            c.streams.drain().collect()
        };
        for stream in &streams {
            self.connector.close_stream(id, *stream).await;
        }
        self.connector.teardown(id).await;

        info!("Destroyed circuit {} ({}, {} streams closed)", id, reason, streams.len());
        self.events.publish(OverlayEvent::CircuitDestroyed {
            circuit_id: id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Destroy every circuit; returns how many went
    pub async fn destroy_all(&self, reason: &str) -> usize {
        let mut destroyed = 0;
        for id in self.circuit_ids().await {
            if self.destroy_circuit(id, reason).await.is_ok() {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Attach a new stream to a ready circuit
    pub async fn attach_stream(&self, id: CircuitId) -> CoreResult<StreamId> {
        let circuit = self.get(id).await.ok_or(CoreError::CircuitNotFound(id))?;
        let mut c = circuit.write().await;
        if !c.is_ready() {
            return Err(CoreError::CircuitBuildFailed(format!("circuit {} is not ready", id)));
        }
        if c.streams.len() >= self.config.max_streams_per_circuit {
            return Err(CoreError::ResourceExhausted(format!(
                "circuit {} carries {} streams",
                id,
                c.streams.len()
            )));
        }
        let stream = self.next_stream.fetch_add(1, Ordering::Relaxed);
        c.streams.insert(stream);
        Ok(stream)
    }

    /// Detach and close a stream
    pub async fn detach_stream(&self, id: CircuitId, stream: StreamId) -> bool {
        let Some(circuit) = self.get(id).await else {
            return false;
        };
        let removed = circuit.write().await.streams.remove(&stream);
        if removed {
            self.connector.close_stream(id, stream).await;
        }
        removed
    }

    /// Schedule a circuit for replacement by the next maintenance pass
    pub async fn mark_degraded(&self, id: CircuitId) -> CoreResult<()> {
        let circuit = self.get(id).await.ok_or(CoreError::CircuitNotFound(id))?;
        let mut c = circuit.write().await;
        if c.state() == CircuitState::Ready {
            c.set_state(CircuitState::Degraded);
        }
        Ok(())
    }

    /// Degrade every ready circuit (entry policy changed)
    pub async fn degrade_all(&self) -> usize {
        let circuits = self.circuits.read().await;
        let mut count = 0;
        for circuit in circuits.values() {
            let mut c = circuit.write().await;
            if c.is_ready() {
                c.set_state(CircuitState::Degraded);
                count += 1;
            }
        }
        count
    }

    /// Destroy expired and degraded circuits, then top up the pool of
    /// ready general circuits. Both halves are bounded by `batch`.
    pub async fn maintain(&self, batch: usize) -> CircuitMaintenance {
        let mut report = CircuitMaintenance::default();
        let max_age = self.config.circuit_timeout();

        let mut doomed = Vec::new();
        {
            let circuits = self.circuits.read().await;
            for (id, circuit) in circuits.iter() {
                let c = circuit.read().await;
                if c.age() >= max_age {
                    doomed.push((*id, "expired"));
                } else if c.state() == CircuitState::Degraded {
                    doomed.push((*id, "degraded"));
                }
                if doomed.len() >= batch {
                    break;
                }
            }
        }
        for (id, reason) in doomed {
            if self.destroy_circuit(id, reason).await.is_ok() {
                report.destroyed += 1;
            }
        }

        let ready = self.ready_count(CircuitPurpose::General).await;
        let missing = self.config.min_circuits.saturating_sub(ready).min(batch);
        for _ in 0..missing {
            match self.build_once(CircuitPurpose::General, None).await {
                Ok(_) => report.built += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Circuit pool top-up failed: {}", e);
                    // Nothing changes between attempts within one pass
                    break;
                }
            }
        }

        if report.destroyed > 0 || report.built > 0 {
            debug!(
                "Circuit maintenance: {} destroyed, {} built",
                report.destroyed, report.built
            );
        }
        report
    }

    pub async fn ready_count(&self, purpose: CircuitPurpose) -> usize {
        let circuits = self.circuits.read().await;
        let mut count = 0;
        for circuit in circuits.values() {
            let c = circuit.read().await;
            if c.purpose() == purpose && c.is_ready() {
                count += 1;
            }
        }
        count
    }

    pub async fn circuit_ids(&self) -> Vec<CircuitId> {
        self.circuits.read().await.keys().copied().collect()
    }

    /// Live circuits in any state
    pub async fn count(&self) -> usize {
        self.circuits.read().await.len()
    }

    pub async fn stats(&self) -> CircuitStats {
        let circuits = self.circuits.read().await;
        let mut stats = CircuitStats::default();
        for circuit in circuits.values() {
            let c = circuit.read().await;
            match c.state() {
                CircuitState::Building => stats.building += 1,
                CircuitState::Ready => stats.ready += 1,
                CircuitState::Degraded => stats.degraded += 1,
                CircuitState::Destroyed => {}
            }
            stats.streams += c.stream_count();
        }
        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::path::tests::relay;

    /// Connector with scripted failures and delays
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub fail_fingerprints: Vec<String>,
        pub delay: Option<Duration>,
        pub extended: Mutex<Vec<(CircuitId, HopRole)>>,
        pub closed_streams: AtomicUsize,
    }

    #[async_trait]
    impl HopConnector for FakeConnector {
        async fn extend(
            &self,
            circuit_id: CircuitId,
            hop: &CircuitHop,
            _previous: Option<&CircuitHop>,
        ) -> CoreResult<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_fingerprints.contains(&hop.fingerprint) {
                return Err(CoreError::CircuitBuildFailed("refused".into()));
            }
            self.extended.lock().await.push((circuit_id, hop.role));
            Ok(())
        }

        async fn close_stream(&self, _circuit_id: CircuitId, _stream_id: StreamId) {
            self.closed_streams.fetch_add(1, Ordering::SeqCst);
        }

        async fn teardown(&self, _circuit_id: CircuitId) {}
    }

    pub(crate) async fn directory() -> Arc<RelayDirectory> {
        let dir = Arc::new(RelayDirectory::new());
        dir.update([
            relay(1, "US", true, false),
            relay(2, "DE", false, false),
            relay(3, "FR", false, false),
            relay(4, "JP", false, true),
        ])
        .await;
        dir
    }

    async fn manager(config: CircuitConfig, connector: Arc<FakeConnector>) -> CircuitManager {
        CircuitManager::new(config, directory().await, connector, EventBus::default())
    }

    #[tokio::test]
    async fn test_create_ready_circuit() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(CircuitConfig::default(), connector.clone()).await;
        let mut events = mgr.events.subscribe();

        let id = mgr.create_circuit(CircuitPurpose::General, None).await.unwrap();
        let circuit = mgr.get(id).await.unwrap();
        let c = circuit.read().await;
        assert!(c.is_ready());
        assert_eq!(c.hop_count(), 3);
        let roles: Vec<HopRole> = c.hops().iter().map(|h| h.role).collect();
        assert_eq!(roles, vec![HopRole::Guard, HopRole::Middle, HopRole::Exit]);

        // Hops were extended in order
        let extended = connector.extended.lock().await.clone();
        assert_eq!(
            extended,
            vec![(id, HopRole::Guard), (id, HopRole::Middle), (id, HopRole::Exit)]
        );
        assert_eq!(
            events.recv().await.unwrap(),
            OverlayEvent::CircuitBuilt {
                circuit_id: id,
                purpose: CircuitPurpose::General
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_hop_destroys_circuit() {
        let exit = relay(4, "JP", false, true).fingerprint;
        let connector = Arc::new(FakeConnector {
            fail_fingerprints: vec![exit],
            ..Default::default()
        });
        let mgr = manager(CircuitConfig::default(), connector).await;

        let err = mgr.create_circuit(CircuitPurpose::General, None).await.unwrap_err();
        assert!(matches!(err, CoreError::CircuitBuildFailed(_)));
        assert_eq!(mgr.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hop_timeout() {
        let connector = Arc::new(FakeConnector {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let config = CircuitConfig {
            build_retries: 0,
            ..Default::default()
        };
        let mgr = manager(config, connector).await;
        let err = mgr.create_circuit(CircuitPurpose::General, None).await.unwrap_err();
        assert!(matches!(err, CoreError::CircuitBuildFailed(_)));
        assert_eq!(mgr.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_build() {
        let connector = Arc::new(FakeConnector {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let mgr = Arc::new(manager(CircuitConfig::default(), connector).await);

        let builder = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.create_circuit(CircuitPurpose::General, None).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let ids = mgr.circuit_ids().await;
        assert_eq!(ids.len(), 1);
        mgr.destroy_circuit(ids[0], "user").await.unwrap();

        assert!(matches!(builder.await.unwrap(), Err(CoreError::Cancelled)));
        assert_eq!(mgr.count().await, 0);
    }

    #[tokio::test]
    async fn test_best_circuit_fewest_streams() {
        let connector = Arc::new(FakeConnector::default());
        let mgr = manager(CircuitConfig::default(), connector.clone()).await;

        let a = mgr.create_circuit(CircuitPurpose::General, None).await.unwrap();
        let b = mgr.create_circuit(CircuitPurpose::General, None).await.unwrap();
        mgr.attach_stream(a).await.unwrap();
        mgr.attach_stream(a).await.unwrap();
        mgr.attach_stream(b).await.unwrap();

        assert_eq!(mgr.get_best_circuit(CircuitPurpose::General).await, Some(b));
        assert_eq!(mgr.get_best_circuit(CircuitPurpose::HsDir).await, None);

        mgr.destroy_circuit(a, "test").await.unwrap();
        assert_eq!(connector.closed_streams.load(Ordering::SeqCst), 2);
        assert!(matches!(
            mgr.destroy_circuit(a, "again").await,
            Err(CoreError::CircuitNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_circuit_limit() {
        let config = CircuitConfig {
            min_circuits: 1,
            max_circuits: 1,
            ..Default::default()
        };
        let mgr = manager(config, Arc::new(FakeConnector::default())).await;
        mgr.create_circuit(CircuitPurpose::General, None).await.unwrap();
        assert!(matches!(
            mgr.create_circuit(CircuitPurpose::Onion, None).await,
            Err(CoreError::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_limit() {
        let config = CircuitConfig {
            max_streams_per_circuit: 1,
            ..Default::default()
        };
        let mgr = manager(config, Arc::new(FakeConnector::default())).await;
        let id = mgr.create_circuit(CircuitPurpose::General, None).await.unwrap();
        let stream = mgr.attach_stream(id).await.unwrap();
        assert!(matches!(
            mgr.attach_stream(id).await,
            Err(CoreError::ResourceExhausted(_))
        ));
        assert!(mgr.detach_stream(id, stream).await);
        assert!(mgr.attach_stream(id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_replaces_old_and_degraded() {
        let config = CircuitConfig {
            min_circuits: 2,
            ..Default::default()
        };
        let mgr = manager(config, Arc::new(FakeConnector::default())).await;

        let report = mgr.maintain(32).await;
        assert_eq!(report.built, 2);
        assert_eq!(mgr.ready_count(CircuitPurpose::General).await, 2);

        let ids = mgr.circuit_ids().await;
        mgr.mark_degraded(ids[0]).await.unwrap();
        let report = mgr.maintain(32).await;
        assert_eq!(report.destroyed, 1);
        assert_eq!(report.built, 1);
        assert!(mgr.get(ids[0]).await.is_none());

        tokio::time::advance(Duration::from_secs(601)).await;
        let report = mgr.maintain(32).await;
        assert_eq!(report.destroyed, 2);
        assert_eq!(report.built, 2);
        assert_eq!(mgr.count().await, 2);
    }

    #[tokio::test]
    async fn test_bridge_entry() {
        let mgr = manager(CircuitConfig::default(), Arc::new(FakeConnector::default())).await;
        let bridge = relay(9, "??", false, false);
        mgr.set_entry_guards(Some(vec![bridge.clone()])).await;
        assert!(mgr.bridges_only().await);

        let id = mgr.create_circuit(CircuitPurpose::General, None).await.unwrap();
        let circuit = mgr.get(id).await.unwrap();
        assert_eq!(circuit.read().await.hops()[0].fingerprint, bridge.fingerprint);
    }

    #[test]
    fn test_purpose_names() {
        assert_eq!("hsdir".parse::<CircuitPurpose>().unwrap(), CircuitPurpose::HsDir);
        assert_eq!(CircuitPurpose::Introduction.to_string(), "introduction");
        assert!("exit".parse::<CircuitPurpose>().is_err());
    }
}
