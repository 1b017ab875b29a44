//! Oblivion Network Layer
//!
//! Provides the peer-to-peer primitives the overlay is built on:
//! - Wire protocol (peer ids, mesh message envelope)
//! - Datagram transports (UDP and in-memory)
//! - Peer directory and bootstrap discovery
//! - NAT classification (STUN probing) and hole punching
//! - Multi-hop mesh routing
//! - Generic relay sessions for peers that cannot connect directly

pub mod discovery;
pub mod error;
pub mod hole_punch;
pub mod nat;
pub mod protocol;
pub mod relay;
pub mod router;
pub mod stun;
pub mod transport;

pub use discovery::{
    BootstrapSource, DiscoveryConfig, HttpBootstrap, Peer, PeerConnector, PeerDirectory,
    PeerEvent, PingConnector,
};
pub use error::{NetworkError, NetworkResult};
pub use hole_punch::{
    HolePunchConfig, HolePuncher, PunchOutcome, PunchStrategy, PunchTarget, StrategyExecutor,
    UdpPunchExecutor,
};
pub use nat::{
    shareable_candidates, Candidate, CandidateKind, NatClassification, NatClassifier, NatConfig,
    ReachabilityProbe, MAX_SHARED_CANDIDATES,
};
pub use protocol::{
    unix_millis, ConnectionState, DhtRecord, Envelope, MessageBody, NatType, PeerCapabilities,
    PeerId, PeerInfo, RouteAdvert, RoutedMessage,
};
pub use relay::{
    is_relay_eligible, RelayCloseReason, RelayConfig, RelayEvent, RelayManager, RelayNegotiator,
    RelaySession, RelaySessionState, TransportNegotiator,
};
pub use router::{MeshConfig, MeshRouter, RouteOutcome, RoutingEntry};
pub use stun::{StunClient, StunProbe, StunResult, DEFAULT_STUN_SERVERS};
pub use transport::{
    InboundMessage, MemoryHub, MemoryTransport, PeerTransport, RequestTracker, UdpMeshTransport,
};
