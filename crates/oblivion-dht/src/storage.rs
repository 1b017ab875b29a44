//! DHT Value Storage
//!
//! Local entries with TTL validity measured on the runtime clock. An entry
//! is valid only while `now - stored_at < ttl`; expired entries are never
//! returned even before a sweep removes them.

use std::collections::HashMap;
use std::time::Duration;

use oblivion_net::{unix_millis, DhtRecord, PeerId};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{DhtError, DhtResult};

/// A stored record with local timing
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub record: DhtRecord,
    /// When this copy became valid locally
    pub stored_at: Instant,
    pub expires_at: Instant,
    /// Published by this node (republished by maintenance)
    pub owned: bool,
    /// Last time this node (re)published it
    pub last_published: Instant,
}

impl StoredValue {
    fn new(record: DhtRecord, ttl: Duration, owned: bool) -> Self {
        let now = Instant::now();
        Self {
            record,
            stored_at: now,
            expires_at: now + ttl,
            owned,
            last_published: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// DHT key-value storage
pub struct DhtStorage {
    values: HashMap<[u8; 32], StoredValue>,
    max_entries: usize,
    max_value_size: usize,
}

impl DhtStorage {
    pub fn with_limits(max_entries: usize, max_value_size: usize) -> Self {
        Self {
            values: HashMap::new(),
            max_entries,
            max_value_size,
        }
    }

    /// Store a record we publish ourselves
    pub fn store_owned(&mut self, record: DhtRecord) -> DhtResult<()> {
        let ttl = Duration::from_millis(record.ttl_ms);
        self.insert(record, ttl, true)
    }

    /// Store a record received from a peer. Its remaining lifetime is its
    /// TTL minus the age implied by the publisher's timestamp.
    pub fn store_replica(&mut self, record: DhtRecord) -> DhtResult<()> {
        let age = unix_millis().saturating_sub(record.timestamp_ms);
        let remaining = record.ttl_ms.saturating_sub(age);
        if remaining == 0 {
            return Err(DhtError::Expired);
        }
        // Never demote our own entry to a replica
        if self.values.get(&record.key).map(|v| v.owned).unwrap_or(false) {
            return Ok(());
        }
        self.insert(record, Duration::from_millis(remaining), false)
    }

    fn insert(&mut self, record: DhtRecord, ttl: Duration, owned: bool) -> DhtResult<()> {
        if ttl.is_zero() {
            return Err(DhtError::Expired);
        }
        if record.value.len() > self.max_value_size {
            return Err(DhtError::ValueTooLarge {
                size: record.value.len(),
                max: self.max_value_size,
            });
        }

        if !self.values.contains_key(&record.key) && self.values.len() >= self.max_entries {
            self.cleanup();
            if self.values.len() >= self.max_entries {
                // Replicas make room for owned entries, never the reverse
                let victim = self
                    .values
                    .iter()
                    .filter(|(_, v)| !v.owned)
                    .min_by_key(|(_, v)| v.expires_at)
                    .map(|(k, _)| *k);
                match victim {
                    Some(key) if owned => {
                        self.values.remove(&key);
                    }
                    _ => return Err(DhtError::StorageFull(self.max_entries)),
                }
            }
        }

        self.values.insert(record.key, StoredValue::new(record, ttl, owned));
        Ok(())
    }

    /// Valid record for `key`
    pub fn get(&self, key: &[u8; 32]) -> Option<&DhtRecord> {
        self.values
            .get(key)
            .filter(|v| !v.is_expired())
            .map(|v| &v.record)
    }

    pub fn remove(&mut self, key: &[u8; 32]) -> Option<StoredValue> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &[u8; 32]) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Remove expired entries
    pub fn cleanup(&mut self) -> usize {
        let before = self.values.len();
        self.values.retain(|_, v| !v.is_expired());
        let removed = before - self.values.len();
        if removed > 0 {
            debug!("Cleaned up {} expired DHT entries", removed);
        }
        removed
    }

    /// Owned entries last published at least `interval` ago, oldest first
    pub fn due_for_republish(&self, interval: Duration, limit: usize) -> Vec<[u8; 32]> {
        let now = Instant::now();
        let mut due: Vec<(&[u8; 32], &StoredValue)> = self
            .values
            .iter()
            .filter(|(_, v)| v.owned && !v.is_expired())
            .filter(|(_, v)| now.duration_since(v.last_published) >= interval)
            .collect();
        due.sort_by_key(|(_, v)| v.last_published);
        due.into_iter().take(limit).map(|(k, _)| *k).collect()
    }

    /// Refresh an owned entry's timestamp and lifetime; returns the record
    /// to replicate
    pub fn refresh_owned(&mut self, key: &[u8; 32], owner: PeerId) -> Option<DhtRecord> {
        let value = self.values.get_mut(key).filter(|v| v.owned)?;
        let now = Instant::now();
        value.record.timestamp_ms = unix_millis();
        value.record.owner = owner;
        value.stored_at = now;
        value.expires_at = now + Duration::from_millis(value.record.ttl_ms);
        value.last_published = now;
        Some(value.record.clone())
    }
}

impl Default for DhtStorage {
    fn default() -> Self {
        Self::with_limits(10_000, 64 * 1024)
    }
}

/// Key derivation
pub mod keys {
    use blake3::Hasher;

    /// Hash a textual key into the DHT keyspace
    pub fn hash(key: &str) -> [u8; 32] {
        let mut hasher = Hasher::new();
        hasher.update(b"oblivion:dht:");
        hasher.update(key.as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Key for a named filter list, e.g. `filter:easylist`
    pub fn filter_list(name: &str) -> String {
        format!("filter:{}", name)
    }

    /// Key for bridge advertisements of one transport, e.g. `bridges:obfs4`
    pub fn bridges(transport: &str) -> String {
        format!("bridges:{}", transport)
    }

    /// Key for the published relay directory
    pub fn relay_directory() -> String {
        "relays:directory".to_string()
    }

    /// Key for an onion service descriptor
    pub fn onion_descriptor(address: &str) -> String {
        format!("onion:{}", address)
    }

    /// XOR distance between two keys (smaller is closer)
    pub fn distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = a[i] ^ b[i];
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u8, ttl_ms: u64) -> DhtRecord {
        DhtRecord {
            key: [n; 32],
            value: vec![n],
            owner: PeerId([1; 32]),
            timestamp_ms: unix_millis(),
            ttl_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_and_expire() {
        let mut storage = DhtStorage::default();
        storage.store_owned(record(1, 1_000)).unwrap();
        assert!(storage.contains(&[1; 32]));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(storage.contains(&[1; 32]));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(storage.get(&[1; 32]).is_none());
        assert_eq!(storage.cleanup(), 1);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut storage = DhtStorage::default();
        assert!(matches!(storage.store_owned(record(1, 0)), Err(DhtError::Expired)));
    }

    #[test]
    fn test_stale_replica_rejected() {
        let mut storage = DhtStorage::default();
        let mut old = record(2, 1_000);
        old.timestamp_ms -= 5_000;
        assert!(storage.store_replica(old).is_err());
    }

    #[test]
    fn test_value_size_limit() {
        let mut storage = DhtStorage::with_limits(10, 4);
        let mut big = record(3, 1_000);
        big.value = vec![0; 5];
        assert!(matches!(
            storage.store_owned(big),
            Err(DhtError::ValueTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn test_full_storage() {
        let mut storage = DhtStorage::with_limits(2, 1024);
        storage.store_replica(record(1, 60_000)).unwrap();
        storage.store_owned(record(2, 60_000)).unwrap();

        // Replicas cannot displace anything
        assert!(matches!(
            storage.store_replica(record(3, 60_000)),
            Err(DhtError::StorageFull(2))
        ));
        // Owned entries evict the replica closest to expiry
        storage.store_owned(record(4, 60_000)).unwrap();
        assert!(!storage.contains(&[1; 32]));
        assert!(storage.contains(&[4; 32]));
    }

    #[test]
    fn test_replica_does_not_replace_owned() {
        let mut storage = DhtStorage::default();
        storage.store_owned(record(5, 60_000)).unwrap();
        let mut foreign = record(5, 60_000);
        foreign.value = vec![99];
        storage.store_replica(foreign).unwrap();
        assert_eq!(storage.get(&[5; 32]).unwrap().value, vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_republish_schedule() {
        let mut storage = DhtStorage::default();
        storage.store_owned(record(1, 3_600_000)).unwrap();
        storage.store_replica(record(2, 3_600_000)).unwrap();

        assert!(storage.due_for_republish(Duration::from_secs(60), 10).is_empty());
        tokio::time::advance(Duration::from_secs(61)).await;

        let due = storage.due_for_republish(Duration::from_secs(60), 10);
        assert_eq!(due, vec![[1; 32]]);
        assert!(storage.refresh_owned(&[1; 32], PeerId([1; 32])).is_some());
        assert!(storage.due_for_republish(Duration::from_secs(60), 10).is_empty());
    }

    #[test]
    fn test_key_derivation() {
        assert_eq!(keys::hash("filter:easylist"), keys::hash(&keys::filter_list("easylist")));
        assert_ne!(keys::hash("filter:easylist"), keys::hash("bridges:obfs4"));
        assert_eq!(keys::distance(&[7; 32], &[7; 32]), [0; 32]);
    }
}
