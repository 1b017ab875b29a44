//! Introduction and rendezvous points

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info};

use super::address::OnionAddress;
use super::ClientAuth;
use crate::circuit::CircuitId;
use crate::error::{CoreError, CoreResult};

/// A relay the service listens on for introductions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroductionPoint {
    pub fingerprint: String,
    pub address: SocketAddr,
    #[serde(default)]
    pub failures: u32,
}

/// Parsed service descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub introduction_points: Vec<IntroductionPoint>,
    /// Service only admits authorized clients
    #[serde(default)]
    pub requires_auth: bool,
}

/// Rendezvous point lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendezvousState {
    Creating,
    Establishing,
    Established,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousPoint {
    pub id: u64,
    /// Onion address this point serves
    pub address: String,
    pub state: RendezvousState,
    pub cookie: [u8; 20],
    closed_at: Option<Instant>,
}

impl RendezvousPoint {
    pub fn new(id: u64, address: &str) -> Self {
        Self {
            id,
            address: address.to_string(),
            state: RendezvousState::Creating,
            cookie: rand::random(),
            closed_at: None,
        }
    }

    pub fn with_state(mut self, state: RendezvousState) -> Self {
        self.state = state;
        self
    }
}

/// Fetches a service descriptor over a directory circuit.
///
/// Real HSv3 descriptor download and decryption plug in here.
#[async_trait]
pub trait DescriptorFetcher: Send + Sync {
    async fn fetch(&self, address: &OnionAddress, circuit: CircuitId) -> CoreResult<ServiceDescriptor>;
}

/// Drives the introduce/rendezvous exchange with a service
#[async_trait]
pub trait RendezvousHandshake: Send + Sync {
    /// Introduce ourselves through `intro`, meeting at `point`
    async fn establish(
        &self,
        address: &OnionAddress,
        point: &RendezvousPoint,
        intro: &IntroductionPoint,
    ) -> CoreResult<()>;

    /// Present client credentials to the service
    async fn authenticate(&self, address: &OnionAddress, auth: &ClientAuth) -> CoreResult<()>;
}

/// Reaches the introduction point over TCP. Stands in for the
/// INTRODUCE1/RENDEZVOUS2 exchange; credentials are accepted when
/// non-empty.
pub struct TcpRendezvous;

#[async_trait]
impl RendezvousHandshake for TcpRendezvous {
    async fn establish(
        &self,
        address: &OnionAddress,
        point: &RendezvousPoint,
        intro: &IntroductionPoint,
    ) -> CoreResult<()> {
        TcpStream::connect(intro.address).await.map_err(|e| {
            CoreError::NetworkError(oblivion_net::NetworkError::ConnectionFailed(format!(
                "introduction point {}: {}",
                intro.address, e
            )))
        })?;
        debug!("Rendezvous {} for {} via {}", point.id, address, intro.fingerprint);
        Ok(())
    }

    async fn authenticate(&self, address: &OnionAddress, auth: &ClientAuth) -> CoreResult<()> {
        if auth.is_empty() {
            return Err(CoreError::AuthenticationFailed(format!(
                "empty credentials for {}",
                address
            )));
        }
        Ok(())
    }
}

/// Introduction points per onion address, least recently used services
/// dropped past capacity
pub struct IntroductionPoints {
    points: LruCache<String, Vec<IntroductionPoint>>,
    failure_threshold: u32,
}

impl IntroductionPoints {
    pub fn new(capacity: usize, failure_threshold: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            points: LruCache::new(capacity),
            failure_threshold,
        }
    }

    /// Replace the set for `address`, keeping failure counts of known points
    pub fn store(&mut self, address: &str, fresh: Vec<IntroductionPoint>) {
        let previous = self.points.pop(address).unwrap_or_default();
        let merged: Vec<IntroductionPoint> = fresh
            .into_iter()
            .map(|mut p| {
                if let Some(old) = previous.iter().find(|o| o.fingerprint == p.fingerprint) {
                    p.failures = p.failures.max(old.failures);
                }
                p
            })
            .filter(|p| p.failures < self.failure_threshold)
            .collect();
        if merged.is_empty() {
            return;
        }
        if let Some((dropped, _)) = self.points.push(address.to_string(), merged) {
            debug!("Introduction table full, dropped {}", dropped);
        }
    }

    /// Points ordered by failure count, lowest first
    pub fn ranked(&self, address: &str) -> Vec<IntroductionPoint> {
        let mut points = self.get(address);
        points.sort_by_key(|p| p.failures);
        points
    }

    pub fn get(&self, address: &str) -> Vec<IntroductionPoint> {
        self.points.peek(address).cloned().unwrap_or_default()
    }

    /// Count a failure; returns true if the point was pruned
    pub fn record_failure(&mut self, address: &str, fingerprint: &str) -> bool {
        let Some(points) = self.points.peek_mut(address) else {
            return false;
        };
        let Some(point) = points.iter_mut().find(|p| p.fingerprint == fingerprint) else {
            return false;
        };
        point.failures += 1;
        if point.failures < self.failure_threshold {
            return false;
        }
        points.retain(|p| p.fingerprint != fingerprint);
        if points.is_empty() {
            self.points.pop(address);
        }
        info!("Pruned introduction point {} for {}", fingerprint, address);
        true
    }

    pub fn record_success(&mut self, address: &str, fingerprint: &str) {
        if let Some(point) = self
            .points
            .peek_mut(address)
            .and_then(|points| points.iter_mut().find(|p| p.fingerprint == fingerprint))
        {
            point.failures = 0;
        }
    }

    /// Number of services with known points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

/// Rendezvous points; closed ones linger to absorb late cells
pub struct RendezvousPoints {
    points: HashMap<u64, RendezvousPoint>,
    retention: Duration,
    next_id: u64,
}

impl RendezvousPoints {
    pub fn new(retention: Duration) -> Self {
        Self {
            points: HashMap::new(),
            retention,
            next_id: 1,
        }
    }

    pub fn create(&mut self, address: &str) -> RendezvousPoint {
        let point = RendezvousPoint::new(self.next_id, address);
        self.next_id += 1;
        self.points.insert(point.id, point.clone());
        point
    }

    /// Move a point to `state`; returns the updated point
    pub fn transition(&mut self, id: u64, state: RendezvousState) -> Option<RendezvousPoint> {
        let point = self.points.get_mut(&id)?;
        debug!("Rendezvous {} state: {:?} -> {:?}", id, point.state, state);
        point.state = state;
        if state == RendezvousState::Closed {
            point.closed_at = Some(Instant::now());
        }
        Some(point.clone())
    }

    pub fn get(&self, id: u64) -> Option<&RendezvousPoint> {
        self.points.get(&id)
    }

    /// Close a point that is still open; returns true if it was
    pub fn close(&mut self, id: u64) -> bool {
        match self.points.get(&id).map(|p| p.state) {
            Some(RendezvousState::Closed) | Some(RendezvousState::Failed) | None => false,
            Some(_) => self.transition(id, RendezvousState::Closed).is_some(),
        }
    }

    /// Points not yet closed or failed
    pub fn open_count(&self) -> usize {
        self.points
            .values()
            .filter(|p| !matches!(p.state, RendezvousState::Closed | RendezvousState::Failed))
            .count()
    }

    /// Close every point
    pub fn close_all(&mut self) {
        let ids: Vec<u64> = self.points.keys().copied().collect();
        for id in ids {
            self.transition(id, RendezvousState::Closed);
        }
    }

    /// Remove failed points and closed ones past retention
    pub fn cleanup(&mut self) -> usize {
        let before = self.points.len();
        let retention = self.retention;
        self.points.retain(|_, p| match p.state {
            RendezvousState::Failed => false,
            RendezvousState::Closed => p
                .closed_at
                .map(|at| at.elapsed() < retention)
                .unwrap_or(false),
            _ => true,
        });
        before - self.points.len()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intro(n: u8, failures: u32) -> IntroductionPoint {
        IntroductionPoint {
            fingerprint: format!("{:02x}", n).repeat(20),
            address: SocketAddr::from(([192, 0, 2, n], 9001)),
            failures,
        }
    }

    #[test]
    fn test_intro_ranking_and_pruning() {
        let mut table = IntroductionPoints::new(8, 2);
        table.store("x.onion", vec![intro(1, 1), intro(2, 0), intro(3, 5)]);

        // Points already past the threshold are not stored
        let ranked = table.ranked("x.onion");
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0], intro(2, 0));

        assert!(table.record_failure("x.onion", &intro(1, 0).fingerprint));
        assert_eq!(table.get("x.onion"), vec![intro(2, 0)]);
        assert!(!table.record_failure("x.onion", &intro(2, 0).fingerprint));
        table.record_success("x.onion", &intro(2, 0).fingerprint);
        assert_eq!(table.ranked("x.onion")[0].failures, 0);
    }

    #[test]
    fn test_store_keeps_failure_history() {
        let mut table = IntroductionPoints::new(8, 3);
        table.store("x.onion", vec![intro(1, 0)]);
        table.record_failure("x.onion", &intro(1, 0).fingerprint);
        table.store("x.onion", vec![intro(1, 0), intro(2, 0)]);
        assert_eq!(table.ranked("x.onion")[1].failures, 1);
    }

    #[test]
    fn test_intro_table_bounded() {
        let mut table = IntroductionPoints::new(2, 3);
        table.store("a.onion", vec![intro(1, 0)]);
        table.store("b.onion", vec![intro(2, 0)]);
        table.store("c.onion", vec![intro(3, 0)]);
        assert_eq!(table.len(), 2);
        assert!(table.get("a.onion").is_empty());

        // A service whose last point is pruned leaves the table
        let mut table = IntroductionPoints::new(2, 1);
        table.store("a.onion", vec![intro(1, 0)]);
        assert!(table.record_failure("a.onion", &intro(1, 0).fingerprint));
        assert!(table.is_empty());
    }

    #[test]
    fn test_close_only_open_points() {
        let mut points = RendezvousPoints::new(Duration::from_secs(30));
        let a = points.create("x.onion");
        let b = points.create("x.onion");
        points.transition(b.id, RendezvousState::Failed);

        assert_eq!(points.open_count(), 1);
        assert!(points.close(a.id));
        assert!(!points.close(a.id));
        assert!(!points.close(b.id));
        assert_eq!(points.get(b.id).unwrap().state, RendezvousState::Failed);
        assert_eq!(points.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_points_retained_briefly() {
        let mut points = RendezvousPoints::new(Duration::from_secs(30));
        let a = points.create("x.onion");
        let b = points.create("x.onion");
        let c = points.create("y.onion");
        points.transition(a.id, RendezvousState::Closed);
        points.transition(b.id, RendezvousState::Failed);
        points.transition(c.id, RendezvousState::Established);

        assert_eq!(points.cleanup(), 1);
        assert_eq!(points.get(a.id).unwrap().state, RendezvousState::Closed);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(points.cleanup(), 1);
        assert!(points.get(a.id).is_none());
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn test_cookies_differ() {
        let mut points = RendezvousPoints::new(Duration::from_secs(30));
        let a = points.create("x.onion");
        let b = points.create("x.onion");
        assert_ne!(a.cookie, b.cookie);
        assert_eq!(a.state, RendezvousState::Creating);
    }
}
