//! Error types for the Colocate environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Network send failed (queue closed, socket error, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target peer has no live connection
    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    /// Connecting to or listening on an address failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a not-connected error.
    pub fn not_connected(peer: impl std::fmt::Display) -> Self {
        Self::PeerNotConnected(peer.to_string())
    }
}

impl From<std::io::Error> for EnvError {
    fn from(err: std::io::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}
