//! Relay directory
//!
//! The set of public relays circuits are built from. Entries arrive from
//! the bootstrap configuration and from the published directory in the DHT.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Relay position flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayFlags {
    pub guard: bool,
    pub exit: bool,
    /// Serves onion service descriptors
    pub hsdir: bool,
}

/// A relay as published in the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Hex fingerprint
    pub fingerprint: String,
    pub address: SocketAddr,
    /// ISO 3166-1 alpha-2, upper case
    pub country: String,
    /// Advertised bandwidth (bytes/sec)
    pub bandwidth: u64,
    #[serde(default)]
    pub flags: RelayFlags,
}

impl RelayDescriptor {
    pub fn new(fingerprint: &str, address: SocketAddr, country: &str, bandwidth: u64) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            address,
            country: country.to_ascii_uppercase(),
            bandwidth,
            flags: RelayFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: RelayFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Coarse network the relay lives in
    pub fn subnet(&self) -> Subnet {
        Subnet::of(self.address.ip())
    }
}

/// A /16 for IPv4 or a /32 for IPv6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subnet {
    V4([u8; 2]),
    V6([u16; 2]),
}

impl Subnet {
    pub fn of(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                Subnet::V4([o[0], o[1]])
            }
            IpAddr::V6(v6) => {
                // Mapped IPv4 counts as IPv4
                if let Some(v4) = v6.to_ipv4_mapped() {
                    let o = v4.octets();
                    return Subnet::V4([o[0], o[1]]);
                }
                let s = v6.segments();
                Subnet::V6([s[0], s[1]])
            }
        }
    }
}

/// Known relays keyed by fingerprint
pub struct RelayDirectory {
    relays: RwLock<HashMap<String, RelayDescriptor>>,
}

impl RelayDirectory {
    pub fn new() -> Self {
        Self {
            relays: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace descriptors; returns how many were new
    pub async fn update(&self, descriptors: impl IntoIterator<Item = RelayDescriptor>) -> usize {
        let mut relays = self.relays.write().await;
        let mut added = 0;
        for desc in descriptors {
            if relays.insert(desc.fingerprint.clone(), desc).is_none() {
                added += 1;
            }
        }
        if added > 0 {
            info!("Relay directory: {} new relays ({} total)", added, relays.len());
        }
        added
    }

    pub async fn remove(&self, fingerprint: &str) -> Option<RelayDescriptor> {
        let removed = self.relays.write().await.remove(fingerprint);
        if removed.is_some() {
            debug!("Removed relay {}", fingerprint);
        }
        removed
    }

    pub async fn get(&self, fingerprint: &str) -> Option<RelayDescriptor> {
        self.relays.read().await.get(fingerprint).cloned()
    }

    /// Snapshot of every relay
    pub async fn snapshot(&self) -> Vec<RelayDescriptor> {
        self.relays.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.relays.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.relays.read().await.is_empty()
    }
}

impl Default for RelayDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_granularity() {
        let a = Subnet::of("10.1.2.3".parse().unwrap());
        let b = Subnet::of("10.1.200.9".parse().unwrap());
        let c = Subnet::of("10.2.2.3".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);

        let x = Subnet::of("2001:db8:1::1".parse().unwrap());
        let y = Subnet::of("2001:db8:ffff::1".parse().unwrap());
        let z = Subnet::of("2001:db9::1".parse().unwrap());
        assert_eq!(x, y);
        assert_ne!(x, z);

        let mapped = Subnet::of("::ffff:10.1.9.9".parse().unwrap());
        assert_eq!(mapped, a);
    }

    #[tokio::test]
    async fn test_update_counts_new() {
        let dir = RelayDirectory::new();
        let relay = RelayDescriptor::new("aa", "1.2.3.4:9001".parse().unwrap(), "de", 1_000);
        assert_eq!(relay.country, "DE");
        assert_eq!(dir.update([relay.clone()]).await, 1);
        assert_eq!(dir.update([relay]).await, 0);
        assert_eq!(dir.len().await, 1);
        assert!(dir.remove("aa").await.is_some());
        assert!(dir.is_empty().await);
    }
}
