//! Network error types

use thiserror::Error;

use crate::resolver::ResolveError;
use crate::router::RouterError;
use overmesh_tunnel::TunnelError;

/// Network overlay errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Tunnel error
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Router error
    #[error("router error: {0}")]
    Router(#[from] RouterError),

    /// Resolver error
    #[error("resolver error: {0}")]
    Resolve(#[from] ResolveError),

    /// Payload encode/decode error
    #[error("codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
