//! STUN Reachability Probing
//!
//! Minimal RFC 5389 binding client. One binding request per rendezvous
//! server yields a server-reflexive candidate; the socket's own routed
//! address yields the host candidate. NAT classification over the
//! gathered candidates lives in [`crate::nat`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};
use crate::nat::{Candidate, CandidateKind, ReachabilityProbe};

/// STUN message types (RFC 5389)
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR: u16 = 0x0111;

/// STUN attributes
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_OTHER_ADDRESS: u16 = 0x802c;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN header length
const HEADER_LEN: usize = 20;

/// Default rendezvous servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Result of a binding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunResult {
    /// Our public address as seen by the server
    pub mapped_address: SocketAddr,
    /// Alternate server address, if advertised
    pub other_address: Option<SocketAddr>,
}

/// STUN client over a single UDP socket
pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    pub async fn bind(bind_addr: SocketAddr, request_timeout: Duration) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket,
            timeout: request_timeout,
        })
    }

    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Resolve `host:port` (or a literal socket address)
    pub async fn resolve_server(server: &str) -> NetworkResult<SocketAddr> {
        if let Ok(addr) = server.parse() {
            return Ok(addr);
        }
        tokio::net::lookup_host(server)
            .await
            .map_err(|e| NetworkError::ConfigError(format!("Failed to resolve '{}': {}", server, e)))?
            .next()
            .ok_or_else(|| NetworkError::ConfigError(format!("No addresses for '{}'", server)))
    }

    /// Address the OS routes toward `server` from (the host candidate)
    pub async fn routed_local_addr(server: SocketAddr) -> NetworkResult<SocketAddr> {
        let bind: SocketAddr = if server.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(server).await?;
        Ok(socket.local_addr()?)
    }

    /// Send a binding request and wait for the matching response
    pub async fn binding_request(&self, server: SocketAddr) -> NetworkResult<StunResult> {
        let mut transaction_id = [0u8; 12];
        getrandom::getrandom(&mut transaction_id)
            .map_err(|e| NetworkError::Protocol(format!("RNG failure: {}", e)))?;

        let request = build_binding_request(&transaction_id);
        self.socket.send_to(&request, server).await?;
        debug!("Sent STUN binding request to {}", server);

        let mut buf = [0u8; 576];
        loop {
            let (len, from) = timeout(self.timeout, self.socket.recv_from(&mut buf)).await??;
            if from != server {
                trace!("Ignoring datagram from {} during STUN exchange", from);
                continue;
            }
            return parse_binding_response(&buf[..len], &transaction_id);
        }
    }
}

/// Build a STUN binding request
pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN);
    packet.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    // No attributes
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet
}

/// Parse a STUN binding response
pub fn parse_binding_response(data: &[u8], expected_txn_id: &[u8; 12]) -> NetworkResult<StunResult> {
    if data.len() < HEADER_LEN {
        return Err(NetworkError::Protocol("STUN response too short".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let txn_id = &data[8..20];

    if msg_type != STUN_BINDING_RESPONSE && msg_type != STUN_BINDING_ERROR {
        return Err(NetworkError::Protocol(format!(
            "Unexpected STUN message type: 0x{:04x}",
            msg_type
        )));
    }
    if magic != MAGIC_COOKIE {
        return Err(NetworkError::Protocol("Invalid STUN magic cookie".into()));
    }
    if txn_id != expected_txn_id {
        return Err(NetworkError::Protocol("Transaction ID mismatch".into()));
    }
    if msg_type == STUN_BINDING_ERROR {
        return Err(NetworkError::Protocol("STUN binding error response".into()));
    }
    if data.len() < HEADER_LEN + msg_len {
        return Err(NetworkError::Protocol("STUN message truncated".into()));
    }

    let mut xor_mapped = None;
    let mut mapped = None;
    let mut other_address = None;

    let end = HEADER_LEN + msg_len;
    let mut pos = HEADER_LEN;
    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > end {
            break;
        }
        let value = &data[pos..pos + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = decode_address(value, Some(&data[4..20])),
            ATTR_MAPPED_ADDRESS => mapped = decode_address(value, None),
            ATTR_OTHER_ADDRESS => other_address = decode_address(value, None),
            _ => {}
        }

        // Attributes are padded to 4 bytes
        pos += (attr_len + 3) & !3;
    }

    // XOR-MAPPED-ADDRESS wins when both are present
    let mapped_address = xor_mapped
        .or(mapped)
        .ok_or_else(|| NetworkError::Protocol("No mapped address in STUN response".into()))?;

    Ok(StunResult {
        mapped_address,
        other_address,
    })
}

/// Decode a (XOR-)MAPPED-ADDRESS value. `xor_key` is cookie || transaction id.
fn decode_address(value: &[u8], xor_key: Option<&[u8]>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if let Some(key) = xor_key {
        port ^= u16::from_be_bytes([key[0], key[1]]);
    }

    let ip = match family {
        0x01 if value.len() >= 8 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if let Some(key) = xor_key {
                octets.iter_mut().zip(key).for_each(|(b, k)| *b ^= k);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(key) = xor_key {
                octets.iter_mut().zip(key).for_each(|(b, k)| *b ^= k);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Reachability probe backed by real STUN binding requests
pub struct StunProbe {
    request_timeout: Duration,
}

impl StunProbe {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for StunProbe {
    async fn probe(&self, server: &str) -> NetworkResult<Vec<Candidate>> {
        let server_addr = StunClient::resolve_server(server).await?;
        let mut candidates = Vec::new();

        if let Ok(host) = StunClient::routed_local_addr(server_addr).await {
            candidates.push(Candidate::new(CandidateKind::Host, host, server));
        }

        let bind: SocketAddr = if server_addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let client = StunClient::bind(bind, self.request_timeout).await?;
        match client.binding_request(server_addr).await {
            Ok(result) => {
                debug!("STUN {} mapped us to {}", server, result.mapped_address);
                candidates.push(Candidate::new(
                    CandidateKind::ServerReflexive,
                    result.mapped_address,
                    server,
                ));
            }
            Err(e) => debug!("STUN binding via {} failed: {}", server, e),
        }

        Ok(candidates)
    }
}
