//! Sessions
//!
//! A session is one logical stream on a named channel. Outbound data is
//! pushed onto the tunnel's shared send queue with full header metadata;
//! inbound data arrives on a bounded per-session queue filled by the
//! tunnel demultiplexer. When the inbound queue is full the tunnel drops
//! the message: delivery is best-effort and higher layers retry.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, oneshot, watch, Mutex};

use crate::error::{TunnelError, TunnelResult};
use crate::message::{Frame, MessageKind};

/// Reserved session id for the listening side of a channel
pub const LISTENER_SESSION_ID: &str = "listener";

/// Capacity of a session's inbound queue
pub(crate) const RECV_BACKLOG: usize = 128;

/// Key of a session in the tunnel session map
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// The single listening session of a channel
    Listener {
        /// Channel name
        channel: String,
    },
    /// A dialled or server-side stream
    Stream {
        /// Channel name
        channel: String,
        /// Stream session id
        id: String,
    },
}

impl SessionKey {
    /// Listener key for a channel
    pub fn listener(channel: impl Into<String>) -> Self {
        SessionKey::Listener {
            channel: channel.into(),
        }
    }

    /// Stream key for a channel and session id
    pub fn stream(channel: impl Into<String>, id: impl Into<String>) -> Self {
        SessionKey::Stream {
            channel: channel.into(),
            id: id.into(),
        }
    }

    /// Interpret a wire `(channel, session)` pair; the reserved id maps
    /// to the listener key
    pub fn from_wire(channel: &str, session_id: &str) -> Self {
        if session_id == LISTENER_SESSION_ID {
            SessionKey::listener(channel)
        } else {
            SessionKey::stream(channel, session_id)
        }
    }

    /// Channel name
    pub fn channel(&self) -> &str {
        match self {
            SessionKey::Listener { channel } => channel,
            SessionKey::Stream { channel, .. } => channel,
        }
    }

    /// Session id as carried on the wire
    pub fn session_id(&self) -> &str {
        match self {
            SessionKey::Listener { .. } => LISTENER_SESSION_ID,
            SessionKey::Stream { id, .. } => id,
        }
    }
}

/// A demultiplexed inbound message, tunnel headers already stripped
pub(crate) struct InboundMessage {
    /// Channel the message arrived on
    pub channel: String,
    /// Wire session id of the sender
    pub session_id: String,
    /// Id of the link the message arrived on
    pub link: String,
    /// Whether the link is a loopback link
    pub loopback: bool,
    /// Remote address of the link
    pub remote: String,
    /// The stripped frame
    pub frame: Frame,
}

/// A message on the tunnel's shared outbound queue
pub(crate) struct OutboundMessage {
    pub kind: MessageKind,
    pub tunnel_id: String,
    pub channel: String,
    pub session_id: String,
    pub frame: Frame,
    /// Pin delivery to this link id; empty = broadcast
    pub link: String,
    /// Return only over a loopback link
    pub loopback: bool,
    /// Locally originated via a dialled session
    pub outbound: bool,
    /// Single-slot reply channel for the fan-out result
    pub err_tx: Option<oneshot::Sender<TunnelResult<()>>>,
}

/// Construction parameters for the shared session state
pub(crate) struct SessionOptions {
    pub tunnel_id: String,
    pub key: SessionKey,
    pub local: String,
    pub remote: String,
    pub outbound: bool,
    pub loopback: bool,
    pub link: String,
    pub opened: bool,
}

/// State shared between a session handle and the tunnel demultiplexer
pub(crate) struct SessionShared {
    pub tunnel_id: String,
    pub key: SessionKey,
    pub local: String,
    pub outbound: bool,
    pub loopback: bool,
    /// Pinned link id; empty = broadcast
    pub link: String,
    remote: StdMutex<String>,
    closed: watch::Sender<bool>,
    opened: watch::Sender<bool>,
}

impl SessionShared {
    pub fn new(opts: SessionOptions) -> Self {
        Self {
            tunnel_id: opts.tunnel_id,
            key: opts.key,
            local: opts.local,
            outbound: opts.outbound,
            loopback: opts.loopback,
            link: opts.link,
            remote: StdMutex::new(opts.remote),
            closed: watch::channel(false).0,
            opened: watch::channel(opts.opened).0,
        }
    }

    pub fn remote(&self) -> String {
        self.remote.lock().unwrap().clone()
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_opened(&self) -> bool {
        *self.opened.borrow()
    }

    pub fn subscribe_opened(&self) -> watch::Receiver<bool> {
        self.opened.subscribe()
    }

    /// First inbound message: record the peer address and fire the wait
    /// signal. Subsequent calls are no-ops.
    pub fn mark_opened(&self, remote: &str) {
        if !self.is_opened() {
            *self.remote.lock().unwrap() = remote.to_string();
            self.opened.send_replace(true);
        }
    }
}

/// One logical stream on a channel
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) recv: Mutex<mpsc::Receiver<InboundMessage>>,
    pub(crate) send: mpsc::Sender<OutboundMessage>,
}

impl Session {
    /// Channel this session belongs to
    pub fn channel(&self) -> &str {
        self.shared.key.channel()
    }

    /// Session id as carried on the wire
    pub fn session_id(&self) -> &str {
        self.shared.key.session_id()
    }

    /// Local endpoint name
    pub fn local(&self) -> &str {
        &self.shared.local
    }

    /// Remote endpoint; set from the first inbound message
    pub fn remote(&self) -> String {
        self.shared.remote()
    }

    /// Whether this session was created by a dial
    pub fn is_outbound(&self) -> bool {
        self.shared.outbound
    }

    /// Wait until the first message has been delivered to this session
    pub async fn wait(&self) {
        let mut opened = self.shared.subscribe_opened();
        let _ = opened.wait_for(|o| *o).await;
    }

    /// Send a frame. Blocks until the fan-out reports a result; an error
    /// means no link accepted the message.
    pub async fn send(&self, frame: Frame) -> TunnelResult<()> {
        if self.shared.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let (err_tx, err_rx) = oneshot::channel();
        let msg = OutboundMessage {
            kind: MessageKind::Message,
            tunnel_id: self.shared.tunnel_id.clone(),
            channel: self.channel().to_string(),
            session_id: self.session_id().to_string(),
            frame,
            link: self.shared.link.clone(),
            loopback: self.shared.loopback,
            outbound: self.shared.outbound,
            err_tx: Some(err_tx),
        };

        self.send
            .send(msg)
            .await
            .map_err(|_| TunnelError::Closed)?;

        match err_rx.await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::Closed),
        }
    }

    /// Receive the next frame on this session
    pub async fn recv(&self) -> TunnelResult<Frame> {
        self.recv_message().await.map(|m| m.frame)
    }

    /// Receive the next inbound message with its demux metadata
    pub(crate) async fn recv_message(&self) -> TunnelResult<InboundMessage> {
        if self.shared.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let mut recv = self.recv.lock().await;
        let mut closed = self.shared.subscribe_closed();
        tokio::select! {
            _ = closed.wait_for(|c| *c) => Err(TunnelError::SessionClosed),
            msg = recv.recv() => msg.ok_or(TunnelError::Closed),
        }
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_from_wire() {
        assert_eq!(
            SessionKey::from_wire("net", LISTENER_SESSION_ID),
            SessionKey::listener("net")
        );
        assert_eq!(
            SessionKey::from_wire("net", "abc"),
            SessionKey::stream("net", "abc")
        );
    }

    #[test]
    fn test_session_key_accessors() {
        let key = SessionKey::stream("control", "s-1");
        assert_eq!(key.channel(), "control");
        assert_eq!(key.session_id(), "s-1");

        let key = SessionKey::listener("control");
        assert_eq!(key.channel(), "control");
        assert_eq!(key.session_id(), LISTENER_SESSION_ID);
    }

    #[test]
    fn test_shared_open_close() {
        let shared = SessionShared::new(SessionOptions {
            tunnel_id: "t".into(),
            key: SessionKey::stream("c", "s"),
            local: "local".into(),
            remote: "c".into(),
            outbound: true,
            loopback: false,
            link: String::new(),
            opened: false,
        });

        assert!(!shared.is_opened());
        shared.mark_opened("10.0.0.1:9000");
        assert!(shared.is_opened());
        assert_eq!(shared.remote(), "10.0.0.1:9000");

        // second open does not overwrite the remote
        shared.mark_opened("10.0.0.2:9000");
        assert_eq!(shared.remote(), "10.0.0.1:9000");

        assert!(!shared.is_closed());
        shared.close();
        assert!(shared.is_closed());
    }
}
