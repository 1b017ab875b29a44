//! Pluggable transports
//!
//! Each bridge names the transport that reaches it. Dispatch goes through
//! a registry; a bridge naming a transport we do not carry fails at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::debug;

use super::BridgeDescriptor;
use crate::error::{CoreError, CoreResult};

/// Transport flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Obfs4,
    Snowflake,
    Meek,
    WebTunnel,
    /// Unobfuscated TCP
    Plain,
}

impl TransportKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "obfs4" => Some(TransportKind::Obfs4),
            "snowflake" => Some(TransportKind::Snowflake),
            "meek" | "meek_lite" => Some(TransportKind::Meek),
            "webtunnel" => Some(TransportKind::WebTunnel),
            "plain" | "vanilla" => Some(TransportKind::Plain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Obfs4 => "obfs4",
            TransportKind::Snowflake => "snowflake",
            TransportKind::Meek => "meek",
            TransportKind::WebTunnel => "webtunnel",
            TransportKind::Plain => "plain",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An established transport connection
#[derive(Debug, Clone)]
pub struct TransportConnection {
    pub kind: TransportKind,
    pub remote: SocketAddr,
    /// Time to establish
    pub latency: Duration,
}

/// A traffic-obfuscation transport
#[async_trait]
pub trait PluggableTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Connect to the bridge within `deadline`
    async fn connect(
        &self,
        bridge: &BridgeDescriptor,
        deadline: Duration,
    ) -> CoreResult<TransportConnection>;
}

/// Measures TCP reachability of the bridge endpoint.
///
/// Stands in for the obfs4/Snowflake/meek handshakes: it proves the
/// endpoint answers, not that the obfuscation layer negotiates.
pub struct TcpReachTransport {
    kind: TransportKind,
}

impl TcpReachTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl PluggableTransport for TcpReachTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(
        &self,
        bridge: &BridgeDescriptor,
        deadline: Duration,
    ) -> CoreResult<TransportConnection> {
        let started = Instant::now();
        let attempt = async {
            let remote = lookup_host(bridge.address.as_str())
                .await
                .map_err(|e| CoreError::BridgeUnreachable(format!("{}: {}", bridge.address, e)))?
                .next()
                .ok_or_else(|| {
                    CoreError::BridgeUnreachable(format!("{}: no address", bridge.address))
                })?;
            TcpStream::connect(remote)
                .await
                .map_err(|e| CoreError::BridgeUnreachable(format!("{}: {}", remote, e)))?;
            Ok::<_, CoreError>(remote)
        };

        let remote = timeout(deadline, attempt).await.map_err(|_| {
            CoreError::BridgeUnreachable(format!("{} timed out", bridge.address))
        })??;

        let latency = started.elapsed();
        debug!("{} bridge {} reachable in {:?}", self.kind, bridge.address, latency);
        Ok(TransportConnection {
            kind: self.kind,
            remote,
            latency,
        })
    }
}

/// Transports available for dispatch
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<TransportKind, Arc<dyn PluggableTransport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the reachability transport for every enabled name
    pub fn with_defaults(enabled: &[String]) -> Self {
        let mut registry = Self::new();
        for kind in enabled.iter().filter_map(|name| TransportKind::parse(name)) {
            registry.register(Arc::new(TcpReachTransport::new(kind)));
        }
        registry
    }

    pub fn register(&mut self, transport: Arc<dyn PluggableTransport>) {
        self.transports.insert(transport.kind(), transport);
    }

    pub fn supports(&self, name: &str) -> bool {
        TransportKind::parse(name)
            .map(|kind| self.transports.contains_key(&kind))
            .unwrap_or(false)
    }

    /// Connect through the transport the bridge names
    pub async fn connect(
        &self,
        bridge: &BridgeDescriptor,
        deadline: Duration,
    ) -> CoreResult<TransportConnection> {
        let transport = TransportKind::parse(&bridge.transport)
            .and_then(|kind| self.transports.get(&kind))
            .ok_or_else(|| {
                CoreError::BridgeUnreachable(format!(
                    "transport '{}' unavailable",
                    bridge.transport
                ))
            })?;
        transport.connect(bridge, deadline).await
    }
}
