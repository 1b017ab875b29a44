//! Core errors

use oblivion_dht::DhtError;
use oblivion_net::NetworkError;
use thiserror::Error;

/// Overlay engine errors
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or checksum-failed onion address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Every hole punching strategy failed
    #[error("NAT traversal failed: {0}")]
    NatTraversalFailed(String),

    /// No viable diverse path, or a hop refused the extension
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    /// Bridge connection or health check failed
    #[error("Bridge unreachable: {0}")]
    BridgeUnreachable(String),

    /// No peer answered a DHT lookup in time
    #[error("DHT query timed out: {0}")]
    DhtQueryTimeout(String),

    /// A configured ceiling was reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Onion service rejected our credentials
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Onion service has no usable descriptor or introduction point
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Protocol version is disabled by configuration
    #[error("Protocol disabled: {0}")]
    ProtocolDisabled(String),

    /// Circuit not found
    #[error("Circuit not found: {0}")]
    CircuitNotFound(u32),

    /// Bridge session not found
    #[error("Bridge session not found: {0}")]
    SessionNotFound(u64),

    /// Engine is not running
    #[error("Engine not running")]
    NotRunning,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Operation was cancelled by its owner
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(NetworkError),

    /// DHT error
    #[error("DHT error: {0}")]
    DhtError(DhtError),
}

impl CoreError {
    /// Whether a caller may retry locally, possibly with another strategy.
    ///
    /// Validation failures, disabled protocols, exhausted ceilings and
    /// rejected credentials are surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::NatTraversalFailed(_)
            | CoreError::CircuitBuildFailed(_)
            | CoreError::BridgeUnreachable(_)
            | CoreError::DhtQueryTimeout(_)
            | CoreError::Timeout => true,
            CoreError::NetworkError(e) => e.is_transient(),
            CoreError::DhtError(DhtError::Timeout) => true,
            _ => false,
        }
    }
}

impl From<NetworkError> for CoreError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::NatTraversalFailed(msg) => CoreError::NatTraversalFailed(msg),
            NetworkError::ResourceExhausted(msg) => CoreError::ResourceExhausted(msg),
            NetworkError::Timeout => CoreError::Timeout,
            NetworkError::Cancelled => CoreError::Cancelled,
            other => CoreError::NetworkError(other),
        }
    }
}

impl From<DhtError> for CoreError {
    fn from(e: DhtError) -> Self {
        match e {
            DhtError::Timeout => CoreError::DhtQueryTimeout("no peer responded".into()),
            DhtError::StorageFull(max) => {
                CoreError::ResourceExhausted(format!("DHT storage full ({} entries)", max))
            }
            DhtError::NetworkError(net) => net.into(),
            other => CoreError::DhtError(other),
        }
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CoreError::Timeout
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::SerializationError(e.to_string())
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(CoreError::CircuitBuildFailed("x".into()).is_retryable());
        assert!(CoreError::BridgeUnreachable("x".into()).is_retryable());
        assert!(!CoreError::InvalidAddress("x".into()).is_retryable());
        assert!(!CoreError::ResourceExhausted("x".into()).is_retryable());
        assert!(!CoreError::AuthenticationFailed("x".into()).is_retryable());
        assert!(!CoreError::ProtocolDisabled("v2".into()).is_retryable());
    }

    #[test]
    fn test_lower_errors_map_to_taxonomy() {
        let e: CoreError = NetworkError::NatTraversalFailed("all strategies".into()).into();
        assert!(matches!(e, CoreError::NatTraversalFailed(_)));

        let e: CoreError = DhtError::Timeout.into();
        assert!(matches!(e, CoreError::DhtQueryTimeout(_)));

        let e: CoreError = DhtError::StorageFull(10).into();
        assert!(matches!(e, CoreError::ResourceExhausted(_)));
    }
}
