//! Transport layer abstractions
//!
//! Traits for the byte transports the tunnel runs over. A transport
//! provides framed, bidirectional sockets; the tunnel never touches raw
//! byte streams itself.

pub mod tcp;

pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::error::TunnelResult;
use crate::message::Frame;

/// A framed, bidirectional connection to a peer
#[async_trait]
pub trait Socket: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: &Frame) -> TunnelResult<()>;

    /// Receive one frame, blocking until it arrives
    async fn recv(&self) -> TunnelResult<Frame>;

    /// Remote peer address
    fn remote(&self) -> String;

    /// Local address of this socket
    fn local(&self) -> String;

    /// Close the connection
    async fn close(&self);
}

/// A bound listener accepting inbound sockets
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Accept the next inbound socket
    async fn accept(&self) -> TunnelResult<Box<dyn Socket>>;

    /// Actual bound address (resolves port 0)
    fn addr(&self) -> String;
}

/// Factory for sockets and listeners
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial a remote address
    async fn dial(&self, addr: &str) -> TunnelResult<Box<dyn Socket>>;

    /// Bind a listener
    async fn listen(&self, addr: &str) -> TunnelResult<Box<dyn TransportListener>>;
}
