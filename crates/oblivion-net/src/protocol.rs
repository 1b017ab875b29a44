//! Mesh Wire Protocol
//!
//! Defines peer identities and the message envelope exchanged between
//! overlay nodes. Every message is wrapped in an [`Envelope`] carrying the
//! sender's id and a timestamp; the body is a closed enum so dispatch is
//! always an exhaustive match.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, NetworkResult};
use crate::nat::Candidate;

/// Maximum encoded envelope size accepted from the wire
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Unique peer identifier (BLAKE3 hash of the peer's public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn from_public_key(key: &[u8; 32]) -> Self {
        let hash = blake3::hash(key);
        Self(*hash.as_bytes())
    }

    /// Fresh random identity (used for ephemeral nodes and tests)
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Short hex form for display (8 bytes = 16 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Full hex form (32 bytes = 64 chars)
    pub fn to_full_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from full hex string (64 chars)
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

/// NAT classification of the local network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    /// Public address visible locally, no translation
    None,
    /// Same public address regardless of destination
    Cone,
    /// Public mapping changes per destination
    Symmetric,
    /// No usable candidates were gathered
    Unknown,
}

impl NatType {
    /// Whether early direct/host-candidate attempts are worth making
    pub fn allows_direct(&self) -> bool {
        matches!(self, NatType::None | NatType::Cone)
    }
}

impl Default for NatType {
    fn default() -> Self {
        NatType::Unknown
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NatType::None => "none",
            NatType::Cone => "cone",
            NatType::Symmetric => "symmetric",
            NatType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// Capability flags advertised by a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCapabilities {
    /// Can relay traffic for NATed peers
    pub relay: bool,
    /// Stores and serves DHT entries
    pub dht: bool,
    /// Operates an unlisted bridge
    pub bridge: bool,
    /// Caches filter lists for other peers
    pub filter_cache: bool,
}

impl PeerCapabilities {
    pub fn full() -> Self {
        Self {
            relay: true,
            dht: true,
            bridge: false,
            filter_cache: true,
        }
    }
}

/// Peer's advertised network information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    /// Transport address
    pub addr: SocketAddr,
    /// Detected NAT type of the peer
    #[serde(default)]
    pub nat_type: NatType,
    #[serde(default)]
    pub capabilities: PeerCapabilities,
    /// Reachability candidates offered for hole punching
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, addr: SocketAddr) -> Self {
        Self {
            peer_id,
            addr,
            nat_type: NatType::Unknown,
            capabilities: PeerCapabilities::default(),
            candidates: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: PeerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A DHT record as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtRecord {
    /// Hashed key
    pub key: [u8; 32],
    pub value: Vec<u8>,
    /// Node that originally published the record
    pub owner: PeerId,
    /// Unix milliseconds when the record was (re)published
    pub timestamp_ms: u64,
    pub ttl_ms: u64,
}

impl DhtRecord {
    /// Whether the record is still valid at `now_ms`
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp_ms) < self.ttl_ms
    }
}

/// Abbreviated routing advertisement (destination reachable in `hops`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAdvert {
    pub destination: PeerId,
    pub hops: u8,
    pub latency_ms: u32,
}

/// Multi-hop routed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    pub destination: PeerId,
    pub source: PeerId,
    pub payload: Vec<u8>,
    pub hop_count: u8,
    pub max_hops: u8,
}

/// Message bodies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Introduce ourselves to a peer
    Handshake { info: PeerInfo },
    /// Liveness / latency probe
    Ping { nonce: u64 },
    Pong { nonce: u64 },

    /// Look up a key
    DhtQuery { query_id: u64, key: [u8; 32] },
    /// Reply to a lookup (`None` = not held)
    DhtResponse {
        query_id: u64,
        record: Option<DhtRecord>,
    },
    /// Replicate a record
    DhtStore { record: DhtRecord },

    /// Ask a peer for a named filter list
    FilterRequest { request_id: u64, name: String },
    FilterResponse {
        request_id: u64,
        name: String,
        content: Option<Vec<u8>>,
    },

    /// Routing table propagation
    RoutingUpdate { routes: Vec<RouteAdvert> },
    /// Payload forwarded across multiple hops
    Routed(RoutedMessage),
}

impl MessageBody {
    /// Wire name of the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Handshake { .. } => "handshake",
            MessageBody::Ping { .. } => "ping",
            MessageBody::Pong { .. } => "pong",
            MessageBody::DhtQuery { .. } => "dht-query",
            MessageBody::DhtResponse { .. } => "dht-response",
            MessageBody::DhtStore { .. } => "dht-store",
            MessageBody::FilterRequest { .. } => "filter-request",
            MessageBody::FilterResponse { .. } => "filter-response",
            MessageBody::RoutingUpdate { .. } => "routing-update",
            MessageBody::Routed(_) => "routed-message",
        }
    }
}

/// Mesh message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub node_id: PeerId,
    /// Unix milliseconds at send time
    pub timestamp_ms: u64,
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(node_id: PeerId, body: MessageBody) -> Self {
        Self {
            node_id,
            timestamp_ms: unix_millis(),
            body,
        }
    }

    pub fn to_bytes(&self) -> NetworkResult<Vec<u8>> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(NetworkError::InvalidMessage(format!(
                "Envelope too large: {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> NetworkResult<Self> {
        if bytes.len() > MAX_ENVELOPE_SIZE {
            return Err(NetworkError::InvalidMessage(format!(
                "Envelope too large: {} bytes",
                bytes.len()
            )));
        }
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Current Unix time in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
