//! Engine configuration

use std::net::SocketAddr;
use std::time::Duration;

use oblivion_dht::DhtConfig;
use oblivion_net::{DiscoveryConfig, HolePunchConfig, MeshConfig, NatConfig, RelayConfig};
use serde::{Deserialize, Serialize};

/// Circuit building configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Ready general-purpose circuits kept in the pool
    pub min_circuits: usize,

    /// Maximum live circuits
    pub max_circuits: usize,

    /// Circuits older than this are destroyed regardless of state
    pub circuit_timeout_secs: u64,

    /// Timeout for extending the circuit by one hop
    pub hop_timeout_ms: u64,

    /// Extra attempts after a failed build
    pub build_retries: u32,

    /// Base backoff between build attempts (doubles each retry)
    pub build_backoff_ms: u64,

    /// Streams a single circuit may carry
    pub max_streams_per_circuit: usize,

    /// Exit countries to prefer (ISO 3166-1 alpha-2)
    pub preferred_exit_countries: Vec<String>,

    /// Only enter the network through bridges
    pub bridges_only: bool,

    /// Maintenance interval
    pub maintain_interval_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            min_circuits: 2,
            max_circuits: 16,
            circuit_timeout_secs: 600, // 10 minutes
            hop_timeout_ms: 10_000,
            build_retries: 2,
            build_backoff_ms: 1_000,
            max_streams_per_circuit: 64,
            preferred_exit_countries: Vec::new(),
            bridges_only: false,
            maintain_interval_secs: 30,
        }
    }
}

impl CircuitConfig {
    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_timeout_secs)
    }

    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }

    pub fn build_backoff(&self) -> Duration {
        Duration::from_millis(self.build_backoff_ms)
    }

    pub fn maintain_interval(&self) -> Duration {
        Duration::from_secs(self.maintain_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_circuits == 0 {
            return Err("max_circuits must be > 0".into());
        }
        if self.min_circuits > self.max_circuits {
            return Err(format!(
                "min_circuits {} exceeds max_circuits {}",
                self.min_circuits, self.max_circuits
            ));
        }
        if self.hop_timeout_ms == 0 {
            return Err("hop_timeout_ms must be > 0".into());
        }
        if self.max_streams_per_circuit == 0 {
            return Err("max_streams_per_circuit must be > 0".into());
        }
        if self.maintain_interval_secs == 0 {
            return Err("maintain_interval_secs must be > 0".into());
        }
        Ok(())
    }
}

/// Bridge subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Transports we are willing to use
    pub enabled_transports: Vec<String>,

    /// Consecutive failures tolerated before a bridge is evicted
    pub max_failures: u32,

    /// Maximum bridges kept in the pool
    pub max_pool_size: usize,

    /// Evicted fingerprints remembered so they are not re-admitted
    pub max_evicted: usize,

    /// Health check interval
    pub health_check_interval_secs: u64,

    /// Timeout for a single bridge test
    pub test_timeout_ms: u64,

    /// Per-session bandwidth ceiling in bytes
    pub session_bandwidth_cap_bytes: u64,

    /// Sessions idle longer than this are torn down
    pub session_idle_timeout_secs: u64,

    /// Maximum concurrent bridge sessions
    pub max_sessions: usize,

    /// Session monitor interval
    pub monitor_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled_transports: vec![
                "obfs4".into(),
                "snowflake".into(),
                "meek".into(),
                "webtunnel".into(),
            ],
            max_failures: 3,
            max_pool_size: 64,
            max_evicted: 1_024,
            health_check_interval_secs: 300,
            test_timeout_ms: 10_000,
            session_bandwidth_cap_bytes: 50 * 1024 * 1024,
            session_idle_timeout_secs: 1_800,
            max_sessions: 32,
            monitor_interval_secs: 10,
        }
    }
}

impl BridgeConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_pool_size == 0 {
            return Err("max_pool_size must be > 0".into());
        }
        if self.test_timeout_ms == 0 {
            return Err("test_timeout_ms must be > 0".into());
        }
        if self.session_bandwidth_cap_bytes == 0 {
            return Err("session_bandwidth_cap_bytes must be > 0".into());
        }
        if self.health_check_interval_secs == 0 || self.monitor_interval_secs == 0 {
            return Err("bridge intervals must be > 0".into());
        }
        Ok(())
    }
}

/// Onion resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnionConfig {
    /// Accept deprecated 16-character addresses
    pub enable_v2: bool,

    /// Resolution cache capacity
    pub cache_size: usize,

    /// Resolution cache TTL
    pub cache_ttl_secs: u64,

    /// Descriptor fetch timeout
    pub descriptor_timeout_ms: u64,

    /// Rendezvous handshake timeout
    pub rendezvous_timeout_ms: u64,

    /// Failures before an introduction point is pruned
    pub intro_failure_threshold: u32,

    /// Services whose introduction points are remembered
    pub intro_table_size: usize,

    /// How long closed rendezvous points linger
    pub closed_retention_secs: u64,

    /// Cache and rendezvous cleanup interval
    pub cleanup_interval_secs: u64,
}

impl Default for OnionConfig {
    fn default() -> Self {
        Self {
            enable_v2: false,
            cache_size: 256,
            cache_ttl_secs: 3_600,
            descriptor_timeout_ms: 30_000,
            rendezvous_timeout_ms: 30_000,
            intro_failure_threshold: 3,
            intro_table_size: 1_024,
            closed_retention_secs: 30,
            cleanup_interval_secs: 60,
        }
    }
}

impl OnionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn descriptor_timeout(&self) -> Duration {
        Duration::from_millis(self.descriptor_timeout_ms)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    pub fn closed_retention(&self) -> Duration {
        Duration::from_secs(self.closed_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.cache_size == 0 {
            return Err("cache_size must be > 0".into());
        }
        if self.intro_failure_threshold == 0 {
            return Err("intro_failure_threshold must be > 0".into());
        }
        if self.intro_table_size == 0 {
            return Err("intro_table_size must be > 0".into());
        }
        if self.cleanup_interval_secs == 0 {
            return Err("cleanup_interval_secs must be > 0".into());
        }
        Ok(())
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Mesh listen address
    pub listen_addr: SocketAddr,

    /// Upper bound on items handled by one maintenance pass
    pub max_maintenance_batch: usize,

    pub discovery: DiscoveryConfig,
    pub nat: NatConfig,
    pub hole_punch: HolePunchConfig,
    pub dht: DhtConfig,
    pub mesh: MeshConfig,
    pub relay: RelayConfig,
    pub circuit: CircuitConfig,
    pub bridge: BridgeConfig,
    pub onion: OnionConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9443)),
            max_maintenance_batch: 32,
            discovery: DiscoveryConfig::default(),
            nat: NatConfig::default(),
            hole_punch: HolePunchConfig::default(),
            dht: DhtConfig::default(),
            mesh: MeshConfig::default(),
            relay: RelayConfig::default(),
            circuit: CircuitConfig::default(),
            bridge: BridgeConfig::default(),
            onion: OnionConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Networks where relays are blocked: bridges only, a larger pool
    pub fn censored_network() -> Self {
        let mut config = Self::default();
        config.circuit.bridges_only = true;
        config.circuit.min_circuits = 4;
        config.circuit.hop_timeout_ms = 20_000;
        config.circuit.build_retries = 4;
        config.bridge.health_check_interval_secs = 120;
        config.bridge.max_failures = 5;
        config.hole_punch.max_attempts = 5;
        config
    }

    /// Constrained devices: smaller caches and pools
    pub fn low_resource() -> Self {
        let mut config = Self::default();
        config.discovery.max_peers = 64;
        config.discovery.max_connections = 8;
        config.dht.max_entries = 1_000;
        config.circuit.min_circuits = 1;
        config.circuit.max_circuits = 4;
        config.bridge.max_pool_size = 16;
        config.onion.cache_size = 32;
        config.relay.max_sessions = 8;
        config.max_maintenance_batch = 8;
        config
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        if self.max_maintenance_batch == 0 {
            return Err("max_maintenance_batch must be > 0".into());
        }
        self.discovery.validate().map_err(|e| format!("discovery: {}", e))?;
        self.nat.validate().map_err(|e| format!("nat: {}", e))?;
        self.hole_punch.validate().map_err(|e| format!("hole_punch: {}", e))?;
        self.dht.validate().map_err(|e| format!("dht: {}", e))?;
        self.mesh.validate().map_err(|e| format!("mesh: {}", e))?;
        self.relay.validate().map_err(|e| format!("relay: {}", e))?;
        self.circuit.validate().map_err(|e| format!("circuit: {}", e))?;
        self.bridge.validate().map_err(|e| format!("bridge: {}", e))?;
        self.onion.validate().map_err(|e| format!("onion: {}", e))?;
        Ok(())
    }
}
