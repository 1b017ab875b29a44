//! Resolution cache: LRU bounded, entries expire after a TTL

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::OnionResolution;

struct CachedResolution {
    resolution: OnionResolution,
    inserted_at: Instant,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Fresh(OnionResolution),
    /// Entry was past its TTL and has been removed
    Expired(OnionResolution),
    Missing,
}

pub struct ResolutionCache {
    entries: Mutex<LruCache<String, CachedResolution>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResolutionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fresh resolution for `address`, counting the hit or miss
    pub async fn get(&self, address: &str) -> Option<OnionResolution> {
        match self.lookup(address).await {
            Lookup::Fresh(resolution) => Some(resolution),
            _ => None,
        }
    }

    /// Like `get`, but hands back an expired entry so its owner can release it
    pub async fn lookup(&self, address: &str) -> Lookup {
        let mut entries = self.entries.lock().await;
        let cached = entries
            .get(address)
            .map(|cached| (cached.inserted_at.elapsed() < self.ttl, cached.resolution.clone()));
        let lookup = match cached {
            Some((true, resolution)) => Lookup::Fresh(resolution),
            Some((false, resolution)) => {
                entries.pop(address);
                Lookup::Expired(resolution)
            }
            None => Lookup::Missing,
        };
        match lookup {
            Lookup::Fresh(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            _ => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        lookup
    }

    /// Insert, returning the entry it displaced (same address or LRU victim)
    pub async fn insert(&self, resolution: OnionResolution) -> Option<OnionResolution> {
        let key = resolution.address.to_string();
        self.entries
            .lock()
            .await
            .push(
                key,
                CachedResolution {
                    resolution,
                    inserted_at: Instant::now(),
                },
            )
            .map(|(_, displaced)| displaced.resolution)
    }

    /// Drop expired entries, returning them
    pub async fn cleanup(&self) -> Vec<OnionResolution> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, cached)| cached.inserted_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .iter()
            .filter_map(|key| entries.pop(key))
            .map(|cached| cached.resolution)
            .collect()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().await.len(),
        }
    }
}
