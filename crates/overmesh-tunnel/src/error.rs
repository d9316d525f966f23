//! Tunnel error types

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encode/decode error
    #[error("codec error: {0}")]
    Codec(String),

    /// Frame exceeds the wire size limit
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Link is present but has not completed the connect handshake
    #[error("link not connected")]
    LinkNotConnected,

    /// Message was pinned to a link that is not in the pool
    #[error("link not found")]
    LinkNotFound,

    /// Outbound message may not use a loopback link
    #[error("link is loopback")]
    LinkLoopback,

    /// Loopback return message may only use a loopback link
    #[error("link is not loopback")]
    LinkNotLoopback,

    /// Message carried a token that does not match ours
    #[error("invalid auth token")]
    InvalidToken,

    /// Dial would collide with an existing session
    #[error("duplicate session on channel {0}")]
    DuplicateSession(String),

    /// Listen called twice on the same channel
    #[error("already listening on {0}")]
    AlreadyListening(String),

    /// Session has been closed
    #[error("session closed")]
    SessionClosed,

    /// Tunnel has been closed
    #[error("tunnel closed")]
    Closed,
}

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;
