//! Oblivion Core
//!
//! The censorship-resistant part of the overlay:
//! - Relay directory and diversity-aware path selection
//! - Circuit building and management
//! - Bridge pool, pluggable transports and bridge sessions
//! - Onion address validation, resolution and rendezvous
//! - The engine that ties these to the mesh, DHT and relay layers

pub mod bridge;
pub mod circuit;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod events;
pub mod onion;
pub mod path;

pub use bridge::{
    Bridge, BridgeDescriptor, BridgeManager, HealthReport, PluggableTransport, SessionCloseReason,
    TransportKind, TransportRegistry,
};
pub use circuit::{
    Circuit, CircuitHop, CircuitId, CircuitManager, CircuitPurpose, CircuitState, CircuitStats,
    HopConnector, HopRole, StreamId, TcpHopConnector,
};
pub use config::{BridgeConfig, CircuitConfig, CoreConfig, OnionConfig};
pub use directory::{RelayDescriptor, RelayDirectory, RelayFlags};
pub use engine::{Bootstrap, Components, EngineState, EngineStatus, OverlayEngine, PeerLink};
pub use error::{CoreError, CoreResult};
pub use events::{EventBus, InterferenceKind, OverlayEvent};
pub use onion::{
    ClientAuth, ConnectOptions, OnionAddress, OnionConnection, OnionResolution, OnionResolver,
    OnionVersion,
};
pub use path::{PathSelector, SelectedPath};

/// Hops in every circuit
pub const CIRCUIT_LENGTH: usize = 3;
