//! Onion Resolver
//!
//! Validates onion addresses, fetches the service descriptor over a
//! directory circuit, picks the least-failed introduction point and drives
//! the rendezvous. Successful resolutions are cached (LRU + TTL); a
//! rendezvous point stays open only while its resolution is cached.
//! Version 2 addresses are refused unless explicitly enabled.

pub mod address;
pub mod base32;
pub mod cache;
pub mod rendezvous;

use std::sync::Arc;

use async_trait::async_trait;
use oblivion_dht::{keys, DhtStore};
use oblivion_net::unix_millis;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::circuit::{CircuitId, CircuitManager, CircuitPurpose, StreamId};
use crate::config::OnionConfig;
use crate::error::{CoreError, CoreResult};
use crate::events::{EventBus, OverlayEvent};

pub use address::{OnionAddress, OnionVersion};
pub use cache::{CacheStats, Lookup, ResolutionCache};
pub use rendezvous::{
    DescriptorFetcher, IntroductionPoint, IntroductionPoints, RendezvousHandshake,
    RendezvousPoint, RendezvousPoints, RendezvousState, ServiceDescriptor, TcpRendezvous,
};

/// Client credentials for an onion service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuth {
    Credentials { username: String, password: String },
    Token(String),
}

impl ClientAuth {
    pub fn is_empty(&self) -> bool {
        match self {
            ClientAuth::Credentials { username, password } => {
                username.is_empty() || password.is_empty()
            }
            ClientAuth::Token(token) => token.is_empty(),
        }
    }
}

/// Options for `OnionResolver::connect`
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub auth: Option<ClientAuth>,
}

/// Result of resolving an onion address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionResolution {
    pub address: OnionAddress,
    pub public_key: Vec<u8>,
    pub introduction_points: Vec<IntroductionPoint>,
    pub rendezvous: RendezvousPoint,
    pub resolved_at_ms: u64,
}

impl OnionResolution {
    pub fn version(&self) -> OnionVersion {
        self.address.version()
    }
}

/// An established onion connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionConnection {
    pub address: String,
    pub circuit_id: CircuitId,
    pub stream_id: StreamId,
    pub rendezvous_id: u64,
}

/// Reads descriptors published in the DHT under `onion:<address>`
pub struct DhtDescriptorFetcher {
    dht: Arc<DhtStore>,
}

impl DhtDescriptorFetcher {
    pub fn new(dht: Arc<DhtStore>) -> Self {
        Self { dht }
    }
}

#[async_trait]
impl DescriptorFetcher for DhtDescriptorFetcher {
    async fn fetch(&self, address: &OnionAddress, _circuit: CircuitId) -> CoreResult<ServiceDescriptor> {
        let bytes = self
            .dht
            .retrieve(&keys::onion_descriptor(address.as_str()))
            .await?
            .ok_or_else(|| CoreError::ServiceUnavailable(format!("no descriptor for {}", address)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Onion address resolver
pub struct OnionResolver {
    config: OnionConfig,
    circuits: Arc<CircuitManager>,
    fetcher: Arc<dyn DescriptorFetcher>,
    handshake: Arc<dyn RendezvousHandshake>,
    cache: ResolutionCache,
    intro_points: Mutex<IntroductionPoints>,
    rendezvous: Mutex<RendezvousPoints>,
    /// Services whose descriptor demands client auth
    auth_required: Mutex<std::collections::HashSet<String>>,
    events: EventBus,
}

impl OnionResolver {
    pub fn new(
        config: OnionConfig,
        circuits: Arc<CircuitManager>,
        fetcher: Arc<dyn DescriptorFetcher>,
        handshake: Arc<dyn RendezvousHandshake>,
        events: EventBus,
    ) -> Self {
        Self {
            cache: ResolutionCache::new(config.cache_size, config.cache_ttl()),
            intro_points: Mutex::new(IntroductionPoints::new(
                config.intro_table_size,
                config.intro_failure_threshold,
            )),
            rendezvous: Mutex::new(RendezvousPoints::new(config.closed_retention())),
            auth_required: Mutex::new(std::collections::HashSet::new()),
            config,
            circuits,
            fetcher,
            handshake,
            events,
        }
    }

    pub fn config(&self) -> &OnionConfig {
        &self.config
    }

    /// Resolve an onion address, from cache when fresh
    pub async fn resolve(&self, input: &str) -> CoreResult<OnionResolution> {
        let address = OnionAddress::parse(input)?;
        if address.version() == OnionVersion::V2 && !self.config.enable_v2 {
            return Err(CoreError::ProtocolDisabled(format!(
                "v2 onion addresses are disabled ({})",
                address
            )));
        }

        match self.cache.lookup(address.as_str()).await {
            Lookup::Fresh(hit) => {
                debug!("Resolution cache hit for {}", address);
                return Ok(hit);
            }
            Lookup::Expired(stale) => self.release(&stale).await,
            Lookup::Missing => {}
        }

        let resolution = match address.version() {
            OnionVersion::V3 => self.resolve_v3(address).await?,
            OnionVersion::V2 => {
                warn!("Resolving deprecated v2 onion address {}", address);
                self.resolve_v2(address).await?
            }
        };

        if let Some(displaced) = self.cache.insert(resolution.clone()).await {
            self.release(&displaced).await;
        }
        info!("Resolved {}", resolution.address);
        self.events.publish(OverlayEvent::OnionResolved {
            address: resolution.address.to_string(),
        });
        Ok(resolution)
    }

    /// Close the rendezvous point of a resolution leaving the cache
    async fn release(&self, resolution: &OnionResolution) {
        if self.rendezvous.lock().await.close(resolution.rendezvous.id) {
            debug!(
                "Closed rendezvous {} for {}",
                resolution.rendezvous.id, resolution.address
            );
        }
    }

    async fn resolve_v3(&self, address: OnionAddress) -> CoreResult<OnionResolution> {
        self.load_descriptor(&address).await?;
        let point = self.rendezvous_via(&address, usize::MAX).await?;
        Ok(self.resolution(address, point).await)
    }

    /// Single introduction attempt, no fallback
    async fn resolve_v2(&self, address: OnionAddress) -> CoreResult<OnionResolution> {
        self.load_descriptor(&address).await?;
        let point = self.rendezvous_via(&address, 1).await?;
        Ok(self.resolution(address, point).await)
    }

    async fn resolution(&self, address: OnionAddress, rendezvous: RendezvousPoint) -> OnionResolution {
        let introduction_points = self.intro_points.lock().await.ranked(address.as_str());
        OnionResolution {
            public_key: address.public_key().to_vec(),
            address,
            introduction_points,
            rendezvous,
            resolved_at_ms: unix_millis(),
        }
    }

    /// Ready circuit for `purpose`, building one if needed
    async fn circuit_for(&self, purpose: CircuitPurpose) -> CoreResult<CircuitId> {
        match self.circuits.get_best_circuit(purpose).await {
            Some(id) => Ok(id),
            None => self.circuits.create_circuit(purpose, None).await,
        }
    }

    async fn load_descriptor(&self, address: &OnionAddress) -> CoreResult<()> {
        let circuit = self.circuit_for(CircuitPurpose::HsDir).await?;
        let descriptor = timeout(
            self.config.descriptor_timeout(),
            self.fetcher.fetch(address, circuit),
        )
        .await??;

        if descriptor.introduction_points.is_empty() {
            return Err(CoreError::ServiceUnavailable(format!(
                "descriptor for {} lists no introduction points",
                address
            )));
        }
        debug!(
            "Descriptor for {}: {} introduction points",
            address,
            descriptor.introduction_points.len()
        );

        {
            let mut required = self.auth_required.lock().await;
            if descriptor.requires_auth {
                required.insert(address.to_string());
            } else {
                required.remove(address.as_str());
            }
        }
        self.intro_points
            .lock()
            .await
            .store(address.as_str(), descriptor.introduction_points);
        Ok(())
    }

    /// Establish a rendezvous point, trying up to `max_intros` introduction
    /// points in order of fewest failures
    async fn rendezvous_via(
        &self,
        address: &OnionAddress,
        max_intros: usize,
    ) -> CoreResult<RendezvousPoint> {
        let candidates = self.intro_points.lock().await.ranked(address.as_str());
        if candidates.is_empty() {
            return Err(CoreError::ServiceUnavailable(format!(
                "no usable introduction points for {}",
                address
            )));
        }

        let point = {
            let mut points = self.rendezvous.lock().await;
            let point = points.create(address.as_str());
            points
                .transition(point.id, RendezvousState::Establishing)
                .unwrap_or(point)
        };

        let mut last_error = None;
        for intro in candidates.iter().take(max_intros) {
            let attempt = timeout(
                self.config.rendezvous_timeout(),
                self.handshake.establish(address, &point, intro),
            )
            .await
            .map_err(CoreError::from)
            .and_then(|r| r);

            match attempt {
                Ok(()) => {
                    self.intro_points
                        .lock()
                        .await
                        .record_success(address.as_str(), &intro.fingerprint);
                    let established = self
                        .rendezvous
                        .lock()
                        .await
                        .transition(point.id, RendezvousState::Established);
                    return established.ok_or(CoreError::Cancelled);
                }
                Err(e) => {
                    debug!("Introduction via {} failed: {}", intro.fingerprint, e);
                    self.intro_points
                        .lock()
                        .await
                        .record_failure(address.as_str(), &intro.fingerprint);
                    last_error = Some(e);
                }
            }
        }

        self.rendezvous
            .lock()
            .await
            .transition(point.id, RendezvousState::Failed);
        Err(last_error.unwrap_or_else(|| {
            CoreError::ServiceUnavailable(format!("rendezvous with {} failed", address))
        }))
    }

    /// Resolve if needed, authenticate when credentials are supplied, and
    /// open a stream on a fresh connection circuit
    pub async fn connect(&self, input: &str, options: ConnectOptions) -> CoreResult<OnionConnection> {
        let resolution = self.resolve(input).await?;
        let address = &resolution.address;

        match &options.auth {
            Some(auth) => self.handshake.authenticate(address, auth).await?,
            None => {
                if self.auth_required.lock().await.contains(address.as_str()) {
                    return Err(CoreError::AuthenticationFailed(format!(
                        "{} requires client authorization",
                        address
                    )));
                }
            }
        }

        let circuit_id = self.circuits.create_circuit(CircuitPurpose::Onion, None).await?;
        let stream_id = match self.circuits.attach_stream(circuit_id).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self
                    .circuits
                    .destroy_circuit(circuit_id, "stream attach failed")
                    .await;
                return Err(e);
            }
        };

        info!("Connected to {} on circuit {}", address, circuit_id);
        Ok(OnionConnection {
            address: address.to_string(),
            circuit_id,
            stream_id,
            rendezvous_id: resolution.rendezvous.id,
        })
    }

    /// Forget every resolution, introduction point and rendezvous
    pub async fn clear(&self) {
        self.cache.clear().await;
        self.intro_points.lock().await.clear();
        self.rendezvous.lock().await.close_all();
        self.auth_required.lock().await.clear();
        debug!("Onion state cleared");
    }

    /// Expire cache entries, closing their rendezvous points, and drop
    /// old rendezvous points
    pub async fn cleanup(&self) -> (usize, usize) {
        let expired = self.cache.cleanup().await;
        for resolution in &expired {
            self.release(resolution).await;
        }
        let points = self.rendezvous.lock().await.cleanup();
        (expired.len(), points)
    }

    /// Rendezvous points still open
    pub async fn open_rendezvous(&self) -> usize {
        self.rendezvous.lock().await.open_count()
    }

    /// Services with remembered introduction points
    pub async fn known_services(&self) -> usize {
        self.intro_points.lock().await.len()
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::circuit::tests::{directory, FakeConnector};
    use crate::config::CircuitConfig;

    pub(crate) struct FakeFetcher {
        pub descriptors: HashMap<String, ServiceDescriptor>,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl DescriptorFetcher for FakeFetcher {
        async fn fetch(&self, address: &OnionAddress, _circuit: CircuitId) -> CoreResult<ServiceDescriptor> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.descriptors
                .get(address.as_str())
                .cloned()
                .ok_or_else(|| CoreError::ServiceUnavailable(address.to_string()))
        }
    }

    /// Refuses scripted introduction points; accepts the token "secret"
    pub(crate) struct FakeHandshake {
        pub refuse: Vec<String>,
        pub attempts: AtomicUsize,
    }

    #[async_trait]
    impl RendezvousHandshake for FakeHandshake {
        async fn establish(
            &self,
            _address: &OnionAddress,
            _point: &RendezvousPoint,
            intro: &IntroductionPoint,
        ) -> CoreResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.contains(&intro.fingerprint) {
                return Err(CoreError::NetworkError(
                    oblivion_net::NetworkError::ConnectionFailed("refused".into()),
                ));
            }
            Ok(())
        }

        async fn authenticate(&self, address: &OnionAddress, auth: &ClientAuth) -> CoreResult<()> {
            match auth {
                ClientAuth::Token(t) if t == "secret" => Ok(()),
                _ => Err(CoreError::AuthenticationFailed(address.to_string())),
            }
        }
    }

    pub(crate) fn intro(n: u8) -> IntroductionPoint {
        IntroductionPoint {
            fingerprint: format!("{:02x}", n).repeat(20),
            address: SocketAddr::from(([198, 51, 100, n], 9001)),
            failures: 0,
        }
    }

    pub(crate) fn service(seed: u8) -> String {
        OnionAddress::from_public_key(&[seed; 32]).to_string()
    }

    struct Fixture {
        resolver: OnionResolver,
        fetcher: Arc<FakeFetcher>,
        handshake: Arc<FakeHandshake>,
    }

    async fn fixture(config: OnionConfig, refuse: Vec<String>) -> Fixture {
        let mut descriptors = HashMap::new();
        descriptors.insert(
            service(1),
            ServiceDescriptor {
                introduction_points: vec![intro(1), intro(2)],
                requires_auth: false,
            },
        );
        descriptors.insert(
            service(2),
            ServiceDescriptor {
                introduction_points: vec![intro(3)],
                requires_auth: true,
            },
        );
        descriptors.insert(
            "exampleonion2345.onion".to_string(),
            ServiceDescriptor {
                introduction_points: vec![intro(4)],
                requires_auth: false,
            },
        );
        fixture_with(config, descriptors, refuse).await
    }

    async fn fixture_with(
        config: OnionConfig,
        descriptors: HashMap<String, ServiceDescriptor>,
        refuse: Vec<String>,
    ) -> Fixture {
        let fetcher = Arc::new(FakeFetcher {
            descriptors,
            calls: AtomicUsize::new(0),
        });
        let handshake = Arc::new(FakeHandshake {
            refuse,
            attempts: AtomicUsize::new(0),
        });
        let events = EventBus::default();
        let circuits = Arc::new(CircuitManager::new(
            CircuitConfig::default(),
            directory().await,
            Arc::new(FakeConnector::default()),
            events.clone(),
        ));
        let resolver = OnionResolver::new(config, circuits, fetcher.clone(), handshake.clone(), events);
        Fixture {
            resolver,
            fetcher,
            handshake,
        }
    }

    #[tokio::test]
    async fn test_resolve_then_cache_hit() {
        let f = fixture(OnionConfig::default(), Vec::new()).await;
        let first = f.resolver.resolve(&service(1)).await.unwrap();
        let second = f.resolver.resolve(&service(1)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.rendezvous.state, RendezvousState::Established);
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 1);
        let stats = f.resolver.cache_stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_refetches() {
        let config = OnionConfig {
            cache_ttl_secs: 10,
            ..Default::default()
        };
        let f = fixture(config, Vec::new()).await;
        f.resolver.resolve(&service(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        f.resolver.resolve(&service(1)).await.unwrap();
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_address_rejected_before_network() {
        let f = fixture(OnionConfig::default(), Vec::new()).await;
        let good = service(1);
        let first = if good.starts_with('a') { "b" } else { "a" };
        let bad = format!("{}{}", first, &good[1..]);
        assert!(matches!(
            f.resolver.resolve(&bad).await,
            Err(CoreError::InvalidAddress(_))
        ));
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_intro_falls_back() {
        let f = fixture(OnionConfig::default(), vec![intro(1).fingerprint]).await;
        let resolution = f.resolver.resolve(&service(1)).await.unwrap();
        assert_eq!(f.handshake.attempts.load(Ordering::SeqCst), 2);
        // The failing point now ranks last
        assert_eq!(resolution.introduction_points[0], intro(2));
        assert_eq!(resolution.introduction_points[1].failures, 1);
    }

    #[tokio::test]
    async fn test_all_intros_failing() {
        let f = fixture(
            OnionConfig::default(),
            vec![intro(1).fingerprint, intro(2).fingerprint],
        )
        .await;
        assert!(f.resolver.resolve(&service(1)).await.is_err());
        let stats = f.resolver.cache_stats().await;
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_v2_disabled_by_default() {
        let f = fixture(OnionConfig::default(), Vec::new()).await;
        assert!(matches!(
            f.resolver.resolve("exampleonion2345.onion").await,
            Err(CoreError::ProtocolDisabled(_))
        ));

        let f = fixture(
            OnionConfig {
                enable_v2: true,
                ..Default::default()
            },
            Vec::new(),
        )
        .await;
        let resolution = f.resolver.resolve("exampleonion2345.onion").await.unwrap();
        assert_eq!(resolution.version(), OnionVersion::V2);
    }

    #[tokio::test]
    async fn test_connect_with_auth() {
        let f = fixture(OnionConfig::default(), Vec::new()).await;

        assert!(matches!(
            f.resolver.connect(&service(2), ConnectOptions::default()).await,
            Err(CoreError::AuthenticationFailed(_))
        ));
        let wrong = ConnectOptions {
            auth: Some(ClientAuth::Token("guess".into())),
        };
        assert!(matches!(
            f.resolver.connect(&service(2), wrong).await,
            Err(CoreError::AuthenticationFailed(_))
        ));

        let right = ConnectOptions {
            auth: Some(ClientAuth::Token("secret".into())),
        };
        let conn = f.resolver.connect(&service(2), right).await.unwrap();
        assert_eq!(conn.address, service(2));
        let circuit = f.resolver.circuits.get(conn.circuit_id).await.unwrap();
        assert_eq!(circuit.read().await.purpose(), CircuitPurpose::Onion);
        assert_eq!(circuit.read().await.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_clear_empties_cache() {
        let f = fixture(OnionConfig::default(), Vec::new()).await;
        f.resolver.resolve(&service(1)).await.unwrap();
        f.resolver.clear().await;
        f.resolver.resolve(&service(1)).await.unwrap();
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_onion_state_stays_bounded() {
        let descriptors = (10..50u8)
            .map(|seed| {
                (
                    service(seed),
                    ServiceDescriptor {
                        introduction_points: vec![intro(seed)],
                        requires_auth: false,
                    },
                )
            })
            .collect();
        let config = OnionConfig {
            cache_size: 4,
            cache_ttl_secs: 10,
            intro_table_size: 8,
            ..Default::default()
        };
        let f = fixture_with(config, descriptors, Vec::new()).await;

        for _ in 0..3 {
            for seed in 10..50u8 {
                let conn = f
                    .resolver
                    .connect(&service(seed), ConnectOptions::default())
                    .await
                    .unwrap();
                f.resolver
                    .circuits
                    .destroy_circuit(conn.circuit_id, "done")
                    .await
                    .unwrap();
                assert!(f.resolver.open_rendezvous().await <= 4);
                assert!(f.resolver.known_services().await <= 8);
            }
            tokio::time::advance(Duration::from_secs(11)).await;
        }
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 120);

        // Expired entries release their points; closed ones age out
        let (expired, _) = f.resolver.cleanup().await;
        assert_eq!(expired, 4);
        assert_eq!(f.resolver.open_rendezvous().await, 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        f.resolver.cleanup().await;
        assert!(f.resolver.rendezvous.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_resolution_closes_rendezvous() {
        let config = OnionConfig {
            cache_ttl_secs: 10,
            ..Default::default()
        };
        let f = fixture(config, Vec::new()).await;
        let first = f.resolver.resolve(&service(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let second = f.resolver.resolve(&service(1)).await.unwrap();

        assert_ne!(first.rendezvous.id, second.rendezvous.id);
        let points = f.resolver.rendezvous.lock().await;
        assert_eq!(points.get(first.rendezvous.id).unwrap().state, RendezvousState::Closed);
        assert_eq!(points.get(second.rendezvous.id).unwrap().state, RendezvousState::Established);
    }
}
