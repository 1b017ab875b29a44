//! DHT Store
//!
//! Publishes records locally and to the `replication_factor` connected
//! peers closest to the key, answers peer queries, and resolves lookups by
//! querying `query_fanout` peers and taking the first live answer. A query
//! no peer answers within the window is a miss, not an error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oblivion_net::{
    unix_millis, DhtRecord, Envelope, MessageBody, PeerDirectory, PeerId, PeerInfo, PeerTransport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::{DhtError, DhtResult};
use crate::storage::{keys, DhtStorage};
use crate::{ALPHA, REPLICATION};

/// DHT configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Peers each stored record is pushed to
    pub replication_factor: usize,
    /// Peers queried in parallel on a local miss
    pub query_fanout: usize,
    /// Lookup window (milliseconds)
    pub query_timeout_ms: u64,
    /// Send timeout per peer (milliseconds)
    pub send_timeout_ms: u64,
    /// Owned entries are republished this often (seconds)
    pub republish_interval_secs: u64,
    /// Expiry sweep interval (seconds)
    pub expiry_interval_secs: u64,
    /// Maximum stored entries
    pub max_entries: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// TTL for records published without an explicit one (seconds)
    pub default_ttl_secs: u64,
    /// Owned entries republished per maintenance pass
    pub max_republish_batch: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            replication_factor: REPLICATION,
            query_fanout: ALPHA,
            query_timeout_ms: 3_000,
            send_timeout_ms: 1_000,
            republish_interval_secs: 3_600,
            expiry_interval_secs: 60,
            max_entries: 10_000,
            max_value_size: 48 * 1024,
            default_ttl_secs: 86_400,
            max_republish_batch: 64,
        }
    }
}

impl DhtConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn republish_interval(&self) -> Duration {
        Duration::from_secs(self.republish_interval_secs)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be at least 1".into());
        }
        if self.query_timeout_ms == 0 {
            return Err("query_timeout_ms must be non-zero".into());
        }
        Ok(())
    }
}

/// Counters exposed through engine status
#[derive(Debug, Default)]
pub struct DhtStats {
    pub local_hits: AtomicU64,
    pub remote_hits: AtomicU64,
    pub misses: AtomicU64,
    pub query_timeouts: AtomicU64,
    pub replicas_sent: AtomicU64,
}

/// Result of one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub republished: usize,
}

/// In-flight lookup
struct PendingQuery {
    key: [u8; 32],
    /// Peers that have not answered yet
    remaining: usize,
    tx: oneshot::Sender<Option<DhtRecord>>,
}

/// Replicated DHT store
pub struct DhtStore {
    local_id: RwLock<PeerId>,
    config: DhtConfig,
    storage: RwLock<DhtStorage>,
    transport: Arc<dyn PeerTransport>,
    directory: Arc<PeerDirectory>,
    pending: Mutex<HashMap<u64, PendingQuery>>,
    next_query: AtomicU64,
    stats: DhtStats,
}

impl DhtStore {
    pub fn new(
        local_id: PeerId,
        config: DhtConfig,
        transport: Arc<dyn PeerTransport>,
        directory: Arc<PeerDirectory>,
    ) -> Self {
        let storage = DhtStorage::with_limits(config.max_entries, config.max_value_size);
        Self {
            local_id: RwLock::new(local_id),
            config,
            storage: RwLock::new(storage),
            transport,
            directory,
            pending: Mutex::new(HashMap::new()),
            next_query: AtomicU64::new(1),
            stats: DhtStats::default(),
        }
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn stats(&self) -> &DhtStats {
        &self.stats
    }

    /// Owned entries keep publishing under the new identity
    pub async fn set_local_id(&self, local_id: PeerId) {
        *self.local_id.write().await = local_id;
    }

    pub async fn entry_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Store `value` under `key` for `ttl` and replicate it.
    ///
    /// Returns the hashed key and how many peers the record was pushed to.
    pub async fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> DhtResult<([u8; 32], usize)> {
        let hashed = keys::hash(key);
        let record = DhtRecord {
            key: hashed,
            value,
            owner: *self.local_id.read().await,
            timestamp_ms: unix_millis(),
            ttl_ms: ttl.as_millis().min(u64::MAX as u128) as u64,
        };

        self.storage.write().await.store_owned(record.clone())?;
        debug!("Stored '{}' locally (ttl {:?})", key, ttl);

        let replicated = self.replicate(&record).await;
        Ok((hashed, replicated))
    }

    /// Look up `key`, locally first, then across peers
    pub async fn retrieve(&self, key: &str) -> DhtResult<Option<Vec<u8>>> {
        let hashed = keys::hash(key);

        if let Some(record) = self.storage.read().await.get(&hashed) {
            self.stats.local_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(record.value.clone()));
        }

        match self.query_peers(hashed).await {
            Ok(Some(record)) => {
                self.stats.remote_hits.fetch_add(1, Ordering::Relaxed);
                let value = record.value.clone();
                // Cache what we fetched; a full store only costs the cache
                if let Err(e) = self.storage.write().await.store_replica(record) {
                    trace!("Not caching fetched record: {}", e);
                }
                Ok(Some(value))
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(DhtError::Timeout) => {
                self.stats.query_timeouts.fetch_add(1, Ordering::Relaxed);
                debug!("Lookup for '{}' timed out", key);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove an owned entry so maintenance stops republishing it
    pub async fn withdraw(&self, key: &str) -> bool {
        self.storage.write().await.remove(&keys::hash(key)).is_some()
    }

    /// Connected peers closest to `key`
    async fn closest_peers(&self, key: &[u8; 32], count: usize) -> Vec<PeerInfo> {
        let mut peers = self.directory.connected_peers().await;
        peers.sort_by_key(|p| keys::distance(key, p.peer_id.as_bytes()));
        peers.truncate(count);
        peers
    }

    async fn replicate(&self, record: &DhtRecord) -> usize {
        let targets = self.closest_peers(&record.key, self.config.replication_factor).await;
        let local_id = *self.local_id.read().await;
        let envelope = Envelope::new(local_id, MessageBody::DhtStore { record: record.clone() });

        let mut sent = 0;
        for peer in targets {
            match timeout(self.config.send_timeout(), self.transport.send(peer.addr, &envelope)).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => debug!("Replication to {} failed: {}", peer.peer_id, e),
                Err(_) => debug!("Replication to {} timed out", peer.peer_id),
            }
        }
        self.stats.replicas_sent.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    async fn query_peers(&self, key: [u8; 32]) -> DhtResult<Option<DhtRecord>> {
        let targets = self.closest_peers(&key, self.config.query_fanout).await;
        if targets.is_empty() {
            return Ok(None);
        }

        let query_id = self.next_query.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            query_id,
            PendingQuery {
                key,
                remaining: targets.len(),
                tx,
            },
        );

        let local_id = *self.local_id.read().await;
        let envelope = Envelope::new(local_id, MessageBody::DhtQuery { query_id, key });
        let mut reached = 0;
        for peer in &targets {
            match timeout(self.config.send_timeout(), self.transport.send(peer.addr, &envelope)).await {
                Ok(Ok(())) => reached += 1,
                _ => debug!("Query {} to {} not sent", query_id, peer.peer_id),
            }
        }

        if reached == 0 {
            self.pending.lock().await.remove(&query_id);
            return Ok(None);
        }
        // Unreached peers will never answer
        if let Some(pending) = self.pending.lock().await.get_mut(&query_id) {
            pending.remaining = reached;
        }

        let result = timeout(self.config.query_timeout(), rx).await;
        self.pending.lock().await.remove(&query_id);
        match result {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(_)) => Ok(None),
            Err(_) => Err(DhtError::Timeout),
        }
    }

    /// Feed a query response; the first live record resolves the lookup
    async fn on_response(&self, query_id: u64, record: Option<DhtRecord>) {
        let mut pending = self.pending.lock().await;
        let Some(query) = pending.get_mut(&query_id) else {
            trace!("Late or unknown DHT response {}", query_id);
            return;
        };

        let live = record.filter(|r| r.key == query.key && r.is_live(unix_millis()));
        match live {
            Some(record) => {
                if let Some(query) = pending.remove(&query_id) {
                    let _ = query.tx.send(Some(record));
                }
            }
            None => {
                query.remaining = query.remaining.saturating_sub(1);
                if query.remaining == 0 {
                    if let Some(query) = pending.remove(&query_id) {
                        let _ = query.tx.send(None);
                    }
                }
            }
        }
    }

    /// Handle a DHT message from the mesh. Returns false for non-DHT bodies.
    pub async fn handle_message(&self, from: SocketAddr, envelope: &Envelope) -> DhtResult<bool> {
        match &envelope.body {
            MessageBody::DhtQuery { query_id, key } => {
                let record = self.storage.read().await.get(key).cloned();
                let local_id = *self.local_id.read().await;
                let reply = Envelope::new(
                    local_id,
                    MessageBody::DhtResponse {
                        query_id: *query_id,
                        record,
                    },
                );
                timeout(self.config.send_timeout(), self.transport.send(from, &reply))
                    .await
                    .map_err(|_| DhtError::Timeout)??;
                Ok(true)
            }
            MessageBody::DhtResponse { query_id, record } => {
                self.on_response(*query_id, record.clone()).await;
                Ok(true)
            }
            MessageBody::DhtStore { record } => {
                match self.storage.write().await.store_replica(record.clone()) {
                    Ok(()) => trace!("Accepted replica from {}", envelope.node_id),
                    Err(e) => debug!("Rejected replica from {}: {}", envelope.node_id, e),
                }
                Ok(true)
            }
            MessageBody::FilterRequest { request_id, name } => {
                let key = keys::hash(&keys::filter_list(name));
                let content = self.storage.read().await.get(&key).map(|r| r.value.clone());
                let local_id = *self.local_id.read().await;
                let reply = Envelope::new(
                    local_id,
                    MessageBody::FilterResponse {
                        request_id: *request_id,
                        name: name.clone(),
                        content,
                    },
                );
                timeout(self.config.send_timeout(), self.transport.send(from, &reply))
                    .await
                    .map_err(|_| DhtError::Timeout)??;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Purge expired entries and republish owned ones that are due
    pub async fn maintain(&self) -> MaintenanceReport {
        let expired = self.storage.write().await.cleanup();

        let due = self
            .storage
            .read()
            .await
            .due_for_republish(self.config.republish_interval(), self.config.max_republish_batch);

        let local_id = *self.local_id.read().await;
        let mut republished = 0;
        for key in due {
            let record = self.storage.write().await.refresh_owned(&key, local_id);
            if let Some(record) = record {
                self.replicate(&record).await;
                republished += 1;
            }
        }

        if expired > 0 || republished > 0 {
            info!("DHT maintenance: {} expired, {} republished", expired, republished);
        }
        MaintenanceReport { expired, republished }
    }

    /// Drop every pending query (shutdown)
    pub async fn cancel_queries(&self) {
        let dropped = self.pending.lock().await.drain().count();
        if dropped > 0 {
            warn!("Cancelled {} in-flight DHT queries", dropped);
        }
    }
}
