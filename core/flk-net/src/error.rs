//! Network error types

use thiserror::Error;

/// Network errors
#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to bind socket: {0}")]
    BindFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("not initialized")]
    NotInitialized,

    #[error("invalid settings rejected")]
    InvalidSettings,

    #[error("protocol error: {0}")]
    Protocol(#[from] flk_protocol::ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetError>;
