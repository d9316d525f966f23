//! Wire message definitions
//!
//! Every message on a link is a [`Frame`]: a header map plus an opaque
//! body. The tunnel claims the `Micro-Tunnel*` header namespace for its
//! own control metadata and strips it before a frame reaches a session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, TunnelResult};

/// Message type header
pub const HEADER_TUNNEL: &str = "Micro-Tunnel";
/// Sender tunnel id header
pub const HEADER_TUNNEL_ID: &str = "Micro-Tunnel-Id";
/// Channel name header
pub const HEADER_TUNNEL_CHANNEL: &str = "Micro-Tunnel-Channel";
/// Session id header
pub const HEADER_TUNNEL_SESSION: &str = "Micro-Tunnel-Session";
/// Shared auth token header
pub const HEADER_TUNNEL_TOKEN: &str = "Micro-Tunnel-Token";

/// Prefix shared by all tunnel control headers
pub const HEADER_TUNNEL_PREFIX: &str = "Micro-Tunnel";

/// Tunnel message type carried in the `Micro-Tunnel` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Link handshake
    Connect,
    /// Link teardown
    Close,
    /// Link liveness probe
    KeepAlive,
    /// Session payload
    Message,
}

impl MessageKind {
    /// Wire form of the message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Connect => "connect",
            MessageKind::Close => "close",
            MessageKind::KeepAlive => "keepalive",
            MessageKind::Message => "message",
        }
    }

    /// Parse the wire form; unknown values yield `None` and are dropped
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "connect" => Some(MessageKind::Connect),
            "close" => Some(MessageKind::Close),
            "keepalive" => Some(MessageKind::KeepAlive),
            "message" => Some(MessageKind::Message),
            _ => None,
        }
    }
}

/// A framed message: header map plus opaque body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Message headers
    pub headers: HashMap<String, String>,
    /// Opaque payload
    pub body: Vec<u8>,
}

impl Frame {
    /// Create an empty frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frame with the given body
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Look up a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Set a header value
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Remove every `Micro-Tunnel*` header before session delivery
    pub fn strip_tunnel_headers(&mut self) {
        self.headers.retain(|k, _| !k.starts_with(HEADER_TUNNEL_PREFIX));
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> TunnelResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TunnelError::Codec(e.to_string()))
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> TunnelResult<Self> {
        bincode::deserialize(bytes).map_err(|e| TunnelError::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [
            MessageKind::Connect,
            MessageKind::Close,
            MessageKind::KeepAlive,
            MessageKind::Message,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("bogus"), None);
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut frame = Frame::with_body(vec![1, 2, 3]);
        frame.set_header("Content-Type", "application/octet-stream");

        let bytes = frame.to_bytes().unwrap();
        let decoded = Frame::from_bytes(&bytes).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_strip_tunnel_headers() {
        let mut frame = Frame::new();
        frame.set_header(HEADER_TUNNEL, "message");
        frame.set_header(HEADER_TUNNEL_ID, "abc");
        frame.set_header(HEADER_TUNNEL_CHANNEL, "test");
        frame.set_header(HEADER_TUNNEL_SESSION, "s1");
        frame.set_header(HEADER_TUNNEL_TOKEN, "secret");
        frame.set_header("X-Custom", "kept");

        frame.strip_tunnel_headers();

        assert_eq!(frame.headers.len(), 1);
        assert_eq!(frame.header("X-Custom"), Some("kept"));
    }
}
