//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection error
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// All hole punching strategies were exhausted
    #[error("NAT traversal failed: {0}")]
    NatTraversalFailed(String),

    /// Malformed message on the wire
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// A configured ceiling was reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No relay-capable peer is available
    #[error("No relay available")]
    NoRelayAvailable,

    /// Relay session not found
    #[error("Relay session not found: {0}")]
    SessionNotFound(u64),

    /// Relay session is not connected
    #[error("Relay session {0} is not connected")]
    SessionNotConnected(u64),

    /// Bootstrap failed
    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Message could not be routed (no route or hop limit reached)
    #[error("Unroutable message: {0}")]
    Unroutable(String),

    /// Operation was cancelled by its owner
    #[error("Operation cancelled")]
    Cancelled,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
}

impl NetworkError {
    /// Transient failures that are worth retrying with another strategy or peer
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::Io(_)
                | NetworkError::ConnectionFailed(_)
                | NetworkError::NatTraversalFailed(_)
                | NetworkError::Timeout
        )
    }
}

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetworkError::Timeout
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::SerializationError(e.to_string())
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
