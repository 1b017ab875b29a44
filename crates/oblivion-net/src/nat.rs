//! NAT Classification
//!
//! Probes several independent rendezvous servers in parallel, collects the
//! candidate addresses they reveal and classifies the local NAT:
//!
//! - `None`: a public address is visible locally
//! - `Cone`: every server saw the same public IP
//! - `Symmetric`: servers saw different public IPs, or nothing public at all
//! - `Unknown`: no candidates were gathered

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::NetworkResult;
use crate::protocol::NatType;
use crate::stun::DEFAULT_STUN_SERVERS;

/// Candidates advertised to other peers
pub const MAX_SHARED_CANDIDATES: usize = 8;

/// NAT probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Rendezvous (STUN) servers, `host:port`
    pub stun_servers: Vec<String>,
    /// Per-probe timeout (milliseconds)
    pub probe_timeout_ms: u64,
    /// Interval between re-classifications (seconds)
    pub reclassify_interval_secs: u64,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            probe_timeout_ms: 3_000,
            reclassify_interval_secs: 300,
        }
    }
}

impl NatConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn reclassify_interval(&self) -> Duration {
        Duration::from_secs(self.reclassify_interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.probe_timeout_ms == 0 {
            return Err("probe_timeout_ms must be non-zero".into());
        }
        Ok(())
    }
}

/// Where a candidate address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandidateKind {
    /// Local interface address
    Host,
    /// Public mapping observed by a rendezvous server
    ServerReflexive,
    /// Address allocated on a relay
    Relay,
}

/// A reachability candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: SocketAddr,
    /// Server that produced the candidate
    pub server: String,
}

impl Candidate {
    pub fn new(kind: CandidateKind, addr: SocketAddr, server: &str) -> Self {
        Self {
            kind,
            addr,
            server: server.to_string(),
        }
    }
}

/// One reachability probe against one rendezvous server
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self, server: &str) -> NetworkResult<Vec<Candidate>>;
}

/// Outcome of a classification pass
#[derive(Debug, Clone)]
pub struct NatClassification {
    pub nat_type: NatType,
    pub previous: NatType,
    pub candidates: Vec<Candidate>,
}

impl NatClassification {
    pub fn changed(&self) -> bool {
        self.nat_type != self.previous
    }
}

/// NAT classifier
pub struct NatClassifier {
    config: NatConfig,
    probe: Arc<dyn ReachabilityProbe>,
    current: RwLock<NatType>,
    candidates: RwLock<Vec<Candidate>>,
}

impl NatClassifier {
    pub fn new(config: NatConfig, probe: Arc<dyn ReachabilityProbe>) -> Self {
        Self {
            config,
            probe,
            current: RwLock::new(NatType::Unknown),
            candidates: RwLock::new(Vec::new()),
        }
    }

    pub async fn nat_type(&self) -> NatType {
        *self.current.read().await
    }

    pub async fn candidates(&self) -> Vec<Candidate> {
        self.candidates.read().await.clone()
    }

    /// Gathered candidates worth advertising for hole punching
    pub async fn shared_candidates(&self) -> Vec<Candidate> {
        shareable_candidates(&self.candidates.read().await)
    }

    /// Probe every configured server in parallel and classify
    pub async fn classify(&self) -> NatClassification {
        let mut probes = JoinSet::new();
        for server in self.config.stun_servers.clone() {
            let probe = self.probe.clone();
            let limit = self.config.probe_timeout();
            probes.spawn(async move {
                let result = timeout(limit, probe.probe(&server)).await;
                (server, result)
            });
        }

        let mut gathered = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((_, Ok(Ok(found)))) => gathered.extend(found),
                Ok((server, Ok(Err(e)))) => debug!("Probe via {} failed: {}", server, e),
                Ok((server, Err(_))) => debug!("Probe via {} timed out", server),
                Err(e) => warn!("Probe task failed: {}", e),
            }
        }

        let nat_type = classify_candidates(&gathered);
        let previous = {
            let mut current = self.current.write().await;
            std::mem::replace(&mut *current, nat_type)
        };
        *self.candidates.write().await = gathered.clone();

        if nat_type != previous {
            info!("NAT type changed: {} -> {}", previous, nat_type);
        } else {
            debug!("NAT type unchanged: {}", nat_type);
        }

        NatClassification {
            nat_type,
            previous,
            candidates: gathered,
        }
    }
}

/// Classify a set of gathered candidates
pub fn classify_candidates(candidates: &[Candidate]) -> NatType {
    if candidates.is_empty() {
        return NatType::Unknown;
    }

    let host_ips: HashSet<IpAddr> = candidates
        .iter()
        .filter(|c| c.kind == CandidateKind::Host)
        .map(|c| c.addr.ip())
        .collect();
    let reflexive_ips: HashSet<IpAddr> = candidates
        .iter()
        .filter(|c| c.kind == CandidateKind::ServerReflexive)
        .map(|c| c.addr.ip())
        .collect();

    if host_ips.iter().any(is_public_ip) {
        return NatType::None;
    }
    if reflexive_ips.iter().any(|ip| host_ips.contains(ip)) {
        return NatType::None;
    }

    match reflexive_ips.len() {
        // Only private host or relay candidates: nothing reachable directly
        0 => NatType::Symmetric,
        1 => NatType::Cone,
        _ => NatType::Symmetric,
    }
}

/// Distinct candidates by address, reflexive mappings first, capped at
/// [`MAX_SHARED_CANDIDATES`]
pub fn shareable_candidates(candidates: &[Candidate]) -> Vec<Candidate> {
    let rank = |kind: CandidateKind| match kind {
        CandidateKind::ServerReflexive => 0,
        CandidateKind::Relay => 1,
        CandidateKind::Host => 2,
    };
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by_key(|c| rank(c.kind));

    let mut seen = HashSet::new();
    sorted
        .into_iter()
        .filter(|c| seen.insert((c.kind, c.addr)))
        .take(MAX_SHARED_CANDIDATES)
        .cloned()
        .collect()
}

/// Globally routable address check
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            let cgnat = octets[0] == 100 && (octets[1] & 0xc0) == 64;
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_multicast()
                || cgnat)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            let unique_local = (first & 0xfe00) == 0xfc00;
            let link_local = (first & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || v6.is_multicast() || unique_local || link_local)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::error::NetworkError;

    /// Probe returning canned candidates per server
    pub(crate) struct CannedProbe {
        pub answers: HashMap<String, Vec<Candidate>>,
    }

    #[async_trait]
    impl ReachabilityProbe for CannedProbe {
        async fn probe(&self, server: &str) -> NetworkResult<Vec<Candidate>> {
            self.answers
                .get(server)
                .cloned()
                .ok_or_else(|| NetworkError::Timeout)
        }
    }

    fn host(addr: &str) -> Candidate {
        Candidate::new(CandidateKind::Host, addr.parse().unwrap(), "s")
    }

    fn srflx(addr: &str) -> Candidate {
        Candidate::new(CandidateKind::ServerReflexive, addr.parse().unwrap(), "s")
    }

    #[test]
    fn test_no_candidates_is_unknown() {
        assert_eq!(classify_candidates(&[]), NatType::Unknown);
    }

    #[test]
    fn test_public_host_is_none() {
        assert_eq!(classify_candidates(&[host("8.8.4.4:5000")]), NatType::None);
    }

    #[test]
    fn test_consistent_mapping_is_cone() {
        let candidates = vec![
            host("192.168.1.10:5000"),
            srflx("81.2.69.160:40000"),
            srflx("81.2.69.160:40001"),
        ];
        assert_eq!(classify_candidates(&candidates), NatType::Cone);
    }

    #[test]
    fn test_inconsistent_mapping_is_symmetric() {
        let candidates = vec![
            host("192.168.1.10:5000"),
            srflx("81.2.69.160:40000"),
            srflx("81.2.69.161:40000"),
        ];
        assert_eq!(classify_candidates(&candidates), NatType::Symmetric);
    }

    #[test]
    fn test_private_only_is_symmetric() {
        let candidates = vec![host("10.1.2.3:5000"), host("192.168.0.4:5000")];
        assert_eq!(classify_candidates(&candidates), NatType::Symmetric);
    }

    #[test]
    fn test_shareable_candidates() {
        let mut candidates = vec![host("192.168.1.10:5000"), srflx("81.2.69.160:40000")];
        // The same mapping seen by several servers is advertised once
        candidates.extend((0..12).map(|_| srflx("81.2.69.160:40000")));
        candidates.extend((0..12).map(|i| srflx(&format!("81.2.69.161:{}", 41000 + i))));

        let shared = shareable_candidates(&candidates);
        assert_eq!(shared.len(), MAX_SHARED_CANDIDATES);
        assert!(shared.iter().all(|c| c.kind == CandidateKind::ServerReflexive));
        assert_eq!(shared[0].addr, "81.2.69.160:40000".parse().unwrap());

        let shared = shareable_candidates(&[host("192.168.1.10:5000"), srflx("81.2.69.160:40000")]);
        assert_eq!(shared[0].kind, CandidateKind::ServerReflexive);
        assert_eq!(shared[1].kind, CandidateKind::Host);
    }

    #[test]
    fn test_public_ip_ranges() {
        assert!(is_public_ip(&"1.1.1.1".parse().unwrap()));
        assert!(!is_public_ip(&"100.64.3.2".parse().unwrap()));
        assert!(!is_public_ip(&"172.16.0.1".parse().unwrap()));
        assert!(!is_public_ip(&"fd00::1".parse().unwrap()));
        assert!(is_public_ip(&"2606:4700::1111".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_classify_parallel_probes() {
        let mut answers = HashMap::new();
        answers.insert(
            "a:3478".to_string(),
            vec![host("192.168.1.10:5000"), srflx("81.2.69.160:40000")],
        );
        answers.insert("b:3478".to_string(), vec![srflx("81.2.69.160:40002")]);

        let config = NatConfig {
            stun_servers: vec!["a:3478".into(), "b:3478".into(), "c:3478".into()],
            ..Default::default()
        };
        let classifier = NatClassifier::new(config, Arc::new(CannedProbe { answers }));

        let result = classifier.classify().await;
        assert_eq!(result.nat_type, NatType::Cone);
        assert!(result.changed());
        assert_eq!(classifier.nat_type().await, NatType::Cone);
        assert_eq!(classifier.candidates().await.len(), 3);

        assert!(!classifier.classify().await.changed());
    }
}
