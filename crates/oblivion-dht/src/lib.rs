//! Oblivion Distributed Hash Table
//!
//! A replicated key/value store over the peer mesh. Values carry a TTL,
//! are replicated to a few nearby peers on store, and are republished by
//! their owner until withdrawn. Filter lists and bridge advertisements
//! are published here.
//!
//! Responses are accepted from any peer without verification.

pub mod error;
pub mod storage;
pub mod store;

pub use error::{DhtError, DhtResult};
pub use storage::{keys, DhtStorage, StoredValue};
pub use store::{DhtConfig, DhtStats, DhtStore, MaintenanceReport};

/// Default replication factor
pub const REPLICATION: usize = 3;

/// Default query fanout
pub const ALPHA: usize = 3;
