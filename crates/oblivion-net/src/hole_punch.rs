//! Hole Punching
//!
//! Drives a staged set of connection strategies toward a remote peer. Each
//! round races every applicable strategy concurrently (each under its own
//! timeout) and takes the first success; rounds repeat up to
//! `max_attempts` with a fixed delay in between. When every round fails the
//! caller falls back to the generic relay manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, trace};

use crate::error::{NetworkError, NetworkResult};
use crate::nat::{Candidate, CandidateKind};
use crate::protocol::{Envelope, MessageBody, NatType, PeerId, PeerInfo, MAX_ENVELOPE_SIZE};

/// Hole punching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HolePunchConfig {
    /// Maximum punch rounds
    pub max_attempts: u32,
    /// Per-strategy attempt timeout (milliseconds)
    pub attempt_timeout_ms: u64,
    /// Delay between rounds (milliseconds)
    pub retry_delay_ms: u64,
    /// Ports sprayed either side of the mapped port by aggressive punching
    pub aggressive_port_spread: u16,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 2_000,
            retry_delay_ms: 500,
            aggressive_port_spread: 8,
        }
    }
}

impl HolePunchConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if self.attempt_timeout_ms == 0 {
            return Err("attempt_timeout_ms must be non-zero".into());
        }
        Ok(())
    }
}

/// Named connection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunchStrategy {
    /// Connect to the advertised address
    Direct,
    /// Connect to the peer's LAN (host) candidates
    HostCandidate,
    /// Simultaneous open against server-reflexive candidates
    ServerReflexive,
    /// Spray neighbouring ports of the reflexive mapping
    AggressivePunch,
    /// Rendezvous through a relay-allocated candidate
    RelayAssisted,
}

impl std::fmt::Display for PunchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PunchStrategy::Direct => "direct",
            PunchStrategy::HostCandidate => "host-candidate",
            PunchStrategy::ServerReflexive => "server-reflexive",
            PunchStrategy::AggressivePunch => "aggressive-punch",
            PunchStrategy::RelayAssisted => "relay-assisted",
        };
        f.write_str(s)
    }
}

/// Strategy order for a pair of NAT types.
///
/// Symmetric NAT on either side skips the early direct/host attempts and
/// puts aggressive and relay-assisted punching first.
pub fn strategy_order(local: NatType, remote: NatType) -> Vec<PunchStrategy> {
    if local == NatType::Symmetric || remote == NatType::Symmetric {
        vec![
            PunchStrategy::AggressivePunch,
            PunchStrategy::RelayAssisted,
            PunchStrategy::ServerReflexive,
        ]
    } else {
        vec![
            PunchStrategy::Direct,
            PunchStrategy::HostCandidate,
            PunchStrategy::ServerReflexive,
            PunchStrategy::AggressivePunch,
            PunchStrategy::RelayAssisted,
        ]
    }
}

/// Remote peer and the candidates it shared with us
#[derive(Debug, Clone)]
pub struct PunchTarget {
    pub peer: PeerInfo,
    pub candidates: Vec<Candidate>,
}

impl PunchTarget {
    pub fn new(peer: PeerInfo, candidates: Vec<Candidate>) -> Self {
        Self { peer, candidates }
    }

    pub fn candidates_of(&self, kind: CandidateKind) -> Vec<SocketAddr> {
        self.candidates
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| c.addr)
            .collect()
    }
}

/// Executes one strategy, returning the verified remote address
#[async_trait]
pub trait StrategyExecutor: Send + Sync {
    async fn attempt(&self, strategy: PunchStrategy, target: &PunchTarget) -> NetworkResult<SocketAddr>;
}

/// Successful punch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchOutcome {
    pub strategy: PunchStrategy,
    pub remote_addr: SocketAddr,
    /// Round in which the punch succeeded (1-based)
    pub round: u32,
    pub elapsed: Duration,
}

/// Hole puncher
pub struct HolePuncher {
    config: HolePunchConfig,
    executor: Arc<dyn StrategyExecutor>,
}

impl HolePuncher {
    pub fn new(config: HolePunchConfig, executor: Arc<dyn StrategyExecutor>) -> Self {
        Self { config, executor }
    }

    pub fn config(&self) -> &HolePunchConfig {
        &self.config
    }

    /// Punch toward `remote`, racing the strategies allowed for the NAT pair
    pub async fn punch(
        &self,
        local: &PeerInfo,
        local_nat: NatType,
        remote: &PunchTarget,
    ) -> NetworkResult<PunchOutcome> {
        let strategies = strategy_order(local_nat, remote.peer.nat_type);
        let started = Instant::now();
        info!(
            "Hole punch {} -> {} (NAT {} / {}), strategies {:?}",
            local.peer_id, remote.peer.peer_id, local_nat, remote.peer.nat_type, strategies
        );

        for round in 1..=self.config.max_attempts {
            if let Some((strategy, remote_addr)) = self.race(&strategies, remote).await {
                info!(
                    "Hole punch to {} succeeded via {} at {} (round {})",
                    remote.peer.peer_id, strategy, remote_addr, round
                );
                return Ok(PunchOutcome {
                    strategy,
                    remote_addr,
                    round,
                    elapsed: started.elapsed(),
                });
            }

            debug!("Hole punch round {} to {} failed", round, remote.peer.peer_id);
            if round < self.config.max_attempts {
                sleep(self.config.retry_delay()).await;
            }
        }

        Err(NetworkError::NatTraversalFailed(format!(
            "{} strategies exhausted after {} rounds",
            strategies.len(),
            self.config.max_attempts
        )))
    }

    /// One round: first strategy to succeed wins, the rest are aborted
    async fn race(
        &self,
        strategies: &[PunchStrategy],
        remote: &PunchTarget,
    ) -> Option<(PunchStrategy, SocketAddr)> {
        let mut attempts = JoinSet::new();
        for &strategy in strategies {
            let executor = self.executor.clone();
            let target = remote.clone();
            let limit = self.config.attempt_timeout();
            attempts.spawn(async move {
                let result = timeout(limit, executor.attempt(strategy, &target))
                    .await
                    .map_err(NetworkError::from)
                    .and_then(|r| r);
                (strategy, result)
            });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok((strategy, Ok(addr))) => {
                    attempts.abort_all();
                    return Some((strategy, addr));
                }
                Ok((strategy, Err(e))) => trace!("Strategy {} failed: {}", strategy, e),
                Err(e) => trace!("Strategy task ended: {}", e),
            }
        }
        None
    }
}

/// UDP executor: sends pings at the strategy's candidate addresses and
/// waits for any ping or pong coming back from one of them.
///
/// Each attempt uses its own ephemeral socket. Relay-assisted punching
/// needs a relay-allocated candidate from the remote side.
pub struct UdpPunchExecutor {
    local_id: PeerId,
    bind_addr: SocketAddr,
    port_spread: u16,
    /// Pings sent per target address
    burst: u32,
}

impl UdpPunchExecutor {
    pub fn new(local_id: PeerId, bind_addr: SocketAddr, port_spread: u16) -> Self {
        Self {
            local_id,
            bind_addr,
            port_spread,
            burst: 3,
        }
    }

    fn targets(&self, strategy: PunchStrategy, target: &PunchTarget) -> Vec<SocketAddr> {
        match strategy {
            PunchStrategy::Direct => vec![target.peer.addr],
            PunchStrategy::HostCandidate => target.candidates_of(CandidateKind::Host),
            PunchStrategy::ServerReflexive => target.candidates_of(CandidateKind::ServerReflexive),
            PunchStrategy::AggressivePunch => target
                .candidates_of(CandidateKind::ServerReflexive)
                .into_iter()
                .flat_map(|addr| {
                    let spread = self.port_spread;
                    let low = addr.port().saturating_sub(spread);
                    let high = addr.port().saturating_add(spread);
                    (low..=high).map(move |port| SocketAddr::new(addr.ip(), port))
                })
                .collect(),
            PunchStrategy::RelayAssisted => target.candidates_of(CandidateKind::Relay),
        }
    }
}

#[async_trait]
impl StrategyExecutor for UdpPunchExecutor {
    async fn attempt(&self, strategy: PunchStrategy, target: &PunchTarget) -> NetworkResult<SocketAddr> {
        let addrs = self.targets(strategy, target);
        if addrs.is_empty() {
            return Err(NetworkError::NatTraversalFailed(format!(
                "no candidates for {}",
                strategy
            )));
        }

        let socket = UdpSocket::bind(self.bind_addr).await?;
        let nonce: u64 = rand::random();
        let ping = Envelope::new(self.local_id, MessageBody::Ping { nonce }).to_bytes()?;

        for _ in 0..self.burst {
            for addr in &addrs {
                // Unreachable candidates are expected here
                let _ = socket.send_to(&ping, addr).await;
            }
        }

        let mut buf = vec![0u8; MAX_ENVELOPE_SIZE];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if !addrs.iter().any(|a| a.ip() == from.ip()) {
                continue;
            }
            let Ok(envelope) = Envelope::from_bytes(&buf[..len]) else {
                continue;
            };
            if envelope.node_id != target.peer.peer_id {
                continue;
            }
            match envelope.body {
                MessageBody::Pong { .. } => return Ok(from),
                MessageBody::Ping { nonce } => {
                    // Simultaneous open: answer and take the path
                    let pong = Envelope::new(self.local_id, MessageBody::Pong { nonce }).to_bytes()?;
                    let _ = socket.send_to(&pong, from).await;
                    return Ok(from);
                }
                _ => continue,
            }
        }
    }
}
