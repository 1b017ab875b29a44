//! DHT error types

use thiserror::Error;

/// DHT errors
#[derive(Debug, Error)]
pub enum DhtError {
    /// Value exceeds the configured size limit
    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    /// Storage is at its entry ceiling
    #[error("DHT storage full ({0} entries)")]
    StorageFull(usize),

    /// TTL of zero or already elapsed
    #[error("Record already expired")]
    Expired,

    /// Invalid message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// No peer answered within the query window
    #[error("Query timed out")]
    Timeout,

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(#[from] oblivion_net::NetworkError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type for DHT operations
pub type DhtResult<T> = Result<T, DhtError>;
