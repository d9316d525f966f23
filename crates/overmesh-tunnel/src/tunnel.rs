//! Tunnel core
//!
//! Owns the link pool and the session map. One fan-out task broadcasts
//! outbound messages across healthy links, a monitor task re-dials dead
//! seed nodes, and every link runs its own receive loop plus (for
//! outbound links) a keepalive loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;
use std::time::Instant;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::TunnelConfig;
use crate::error::{TunnelError, TunnelResult};
use crate::link::Link;
use crate::listener::TunnelListener;
use crate::message::{
    Frame, MessageKind, HEADER_TUNNEL, HEADER_TUNNEL_CHANNEL, HEADER_TUNNEL_ID,
    HEADER_TUNNEL_SESSION, HEADER_TUNNEL_TOKEN,
};
use crate::session::{
    InboundMessage, OutboundMessage, Session, SessionKey, SessionOptions, SessionShared,
    RECV_BACKLOG,
};
use crate::transport::{Transport, TransportListener};

/// Capacity of the shared outbound queue
const SEND_BACKLOG: usize = 128;

/// Observable state of one link in the pool
#[derive(Clone, Debug)]
pub struct LinkInfo {
    /// Link id
    pub id: String,
    /// Remote address the pool keys this link by
    pub remote: String,
    /// Whether the connect handshake completed
    pub connected: bool,
    /// Whether the remote endpoint is this tunnel itself
    pub loopback: bool,
    /// Last observed keepalive
    pub last_keep_alive: Instant,
}

#[derive(Clone)]
struct SessionEntry {
    shared: Arc<SessionShared>,
    recv_tx: mpsc::Sender<InboundMessage>,
}

#[derive(Default)]
struct TunnelState {
    connected: bool,
    listen_addr: String,
    links: HashMap<String, Arc<Link>>,
    sessions: HashMap<SessionKey, SessionEntry>,
}

/// The link-and-session multiplexer
pub struct Tunnel {
    id: String,
    token: String,
    address: String,
    config: TunnelConfig,
    transport: Arc<dyn Transport>,
    nodes: StdRwLock<Vec<String>>,
    send_tx: mpsc::Sender<OutboundMessage>,
    send_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
    closed: StdMutex<watch::Sender<bool>>,
    state: RwLock<TunnelState>,
}

impl Tunnel {
    /// Create a new tunnel. An empty config id gets a fresh UUID.
    pub fn new(config: TunnelConfig, transport: Arc<dyn Transport>) -> Self {
        let id = if config.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            config.id.clone()
        };
        let (send_tx, send_rx) = mpsc::channel(SEND_BACKLOG);

        Self {
            id,
            token: config.token.clone(),
            address: config.address.clone(),
            nodes: StdRwLock::new(config.nodes.clone()),
            config,
            transport,
            send_tx,
            send_rx: Arc::new(Mutex::new(send_rx)),
            closed: StdMutex::new(watch::channel(false).0),
            state: RwLock::new(TunnelState::default()),
        }
    }

    /// This tunnel's id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bound listener address once connected, configured address before
    pub async fn address(&self) -> String {
        let state = self.state.read().await;
        if state.connected && !state.listen_addr.is_empty() {
            state.listen_addr.clone()
        } else {
            self.address.clone()
        }
    }

    /// Replace the seed node set; the reconnect monitor dials additions
    pub fn init_nodes(&self, nodes: Vec<String>) {
        *self.nodes.write().unwrap() = nodes;
    }

    /// Snapshot of the link pool
    pub async fn links(&self) -> Vec<LinkInfo> {
        let state = self.state.read().await;
        state
            .links
            .values()
            .map(|link| LinkInfo {
                id: link.id().to_string(),
                remote: link.remote(),
                connected: link.is_connected(),
                loopback: link.is_loopback(),
                last_keep_alive: link.last_keep_alive(),
            })
            .collect()
    }

    fn closed_rx(&self) -> watch::Receiver<bool> {
        self.closed.lock().unwrap().subscribe()
    }

    fn nodes_snapshot(&self) -> Vec<String> {
        self.nodes.read().unwrap().clone()
    }

    /// Bind the transport, dial the seed nodes and start the background
    /// tasks. Idempotent while connected.
    pub async fn connect(self: &Arc<Self>) -> TunnelResult<()> {
        let mut state = self.state.write().await;
        if state.connected {
            return Ok(());
        }

        let listener = self.transport.listen(&self.address).await?;
        state.listen_addr = listener.addr();
        debug!("tunnel {} listening on {}", self.id, state.listen_addr);

        // fresh shutdown signal for this connection epoch
        *self.closed.lock().unwrap() = watch::channel(false).0;

        self.spawn_accept(listener);

        for node in self.nodes_snapshot() {
            if node.is_empty() {
                continue;
            }
            match self.setup_link(&node).await {
                Ok(link) => {
                    state.links.insert(node, link);
                }
                Err(e) => {
                    debug!("failed to establish link to {}: {}", node, e);
                }
            }
        }

        let tunnel = Arc::clone(self);
        let closed_rx = self.closed_rx();
        tokio::spawn(async move { tunnel.process(closed_rx).await });

        let tunnel = Arc::clone(self);
        tokio::spawn(async move { tunnel.monitor().await });

        state.connected = true;
        Ok(())
    }

    /// Close every session and link and stop the background tasks.
    /// Idempotent.
    pub async fn close(&self) -> TunnelResult<()> {
        let mut state = self.state.write().await;
        if !state.connected {
            return Ok(());
        }
        debug!("tunnel {} closing", self.id);

        for (_, entry) in state.sessions.drain() {
            entry.shared.close();
        }

        self.closed.lock().unwrap().send_replace(true);

        let mut frame = Frame::new();
        frame.set_header(HEADER_TUNNEL, MessageKind::Close.as_str());
        frame.set_header(HEADER_TUNNEL_ID, &self.id);
        frame.set_header(HEADER_TUNNEL_TOKEN, &self.token);

        for (_, link) in state.links.drain() {
            let _ = link.send(&frame).await;
            link.close().await;
        }

        state.connected = false;
        state.listen_addr.clear();
        Ok(())
    }

    /// Open an outbound session on a channel
    pub async fn dial(&self, channel: &str) -> TunnelResult<Session> {
        debug!("tunnel dialing channel {}", channel);
        let key = SessionKey::stream(channel, Uuid::new_v4().to_string());
        self.new_session(key, "local".to_string(), channel.to_string(), true)
            .await
            .ok_or_else(|| TunnelError::DuplicateSession(channel.to_string()))
    }

    /// Listen for inbound sessions on a channel
    pub async fn listen(&self, channel: &str) -> TunnelResult<TunnelListener> {
        debug!("tunnel listening on channel {}", channel);
        let key = SessionKey::listener(channel);
        let session = self
            .new_session(key, channel.to_string(), "remote".to_string(), false)
            .await
            .ok_or_else(|| TunnelError::AlreadyListening(channel.to_string()))?;
        Ok(TunnelListener::new(channel, session))
    }

    async fn new_session(
        &self,
        key: SessionKey,
        local: String,
        remote: String,
        outbound: bool,
    ) -> Option<Session> {
        let (recv_tx, recv_rx) = mpsc::channel(RECV_BACKLOG);
        let shared = Arc::new(SessionShared::new(SessionOptions {
            tunnel_id: self.id.clone(),
            key: key.clone(),
            local,
            remote,
            outbound,
            loopback: false,
            link: String::new(),
            opened: false,
        }));

        let mut state = self.state.write().await;
        if state.sessions.contains_key(&key) {
            return None;
        }
        state.sessions.insert(
            key,
            SessionEntry {
                shared: shared.clone(),
                recv_tx,
            },
        );

        Some(Session {
            shared,
            recv: Mutex::new(recv_rx),
            send: self.send_tx.clone(),
        })
    }

    /// Dial a node, perform the connect handshake and start the link's
    /// receive and keepalive loops.
    async fn setup_link(self: &Arc<Self>, node: &str) -> TunnelResult<Arc<Link>> {
        debug!("setting up link to {}", node);
        let socket = self.transport.dial(node).await?;

        let mut frame = Frame::new();
        frame.set_header(HEADER_TUNNEL, MessageKind::Connect.as_str());
        frame.set_header(HEADER_TUNNEL_ID, &self.id);
        frame.set_header(HEADER_TUNNEL_TOKEN, &self.token);
        socket.send(&frame).await?;

        let link = Arc::new(Link::new(Arc::from(socket)));
        // we made the outbound connection and sent the handshake
        link.set_connected(true);

        let tunnel = Arc::clone(self);
        let recv_link = link.clone();
        tokio::spawn(async move { tunnel.listen_link(recv_link).await });

        let tunnel = Arc::clone(self);
        let ka_link = link.clone();
        tokio::spawn(async move { tunnel.keepalive(ka_link).await });

        Ok(link)
    }

    fn spawn_accept(self: &Arc<Self>, listener: Box<dyn TransportListener>) {
        let tunnel = Arc::clone(self);
        let mut closed_rx = self.closed_rx();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_rx.wait_for(|c| *c) => return,
                    res = listener.accept() => match res {
                        Ok(socket) => {
                            // inbound links are saved only once their
                            // connect handshake is observed
                            let link = Arc::new(Link::new(Arc::from(socket)));
                            let tunnel = Arc::clone(&tunnel);
                            tokio::spawn(async move { tunnel.listen_link(link).await });
                        }
                        Err(e) => {
                            debug!("tunnel listener died: {}", e);
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Re-dial configured nodes that have no live link.
    async fn monitor(self: Arc<Self>) {
        let mut reconnect = interval(self.config.reconnect_interval);
        reconnect.tick().await;
        let mut closed_rx = self.closed_rx();

        loop {
            tokio::select! {
                _ = closed_rx.changed() => return,
                _ = reconnect.tick() => {
                    let nodes = self.nodes_snapshot();
                    let missing: Vec<String> = {
                        let state = self.state.read().await;
                        nodes
                            .into_iter()
                            .filter(|n| !n.is_empty() && !state.links.contains_key(n))
                            .collect()
                    };

                    for node in missing {
                        match self.setup_link(&node).await {
                            Ok(link) => {
                                self.state.write().await.links.insert(node, link);
                            }
                            Err(e) => {
                                debug!("failed to re-establish link to {}: {}", node, e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Periodic keepalive on an outbound link. A send failure removes
    /// the link; the monitor will re-dial it.
    async fn keepalive(self: Arc<Self>, link: Arc<Link>) {
        let mut keepalive = interval(self.config.keepalive_interval);
        keepalive.tick().await;
        let mut closed_rx = self.closed_rx();

        loop {
            tokio::select! {
                _ = closed_rx.changed() => return,
                _ = keepalive.tick() => {
                    let mut frame = Frame::new();
                    frame.set_header(HEADER_TUNNEL, MessageKind::KeepAlive.as_str());
                    frame.set_header(HEADER_TUNNEL_ID, &self.id);
                    frame.set_header(HEADER_TUNNEL_TOKEN, &self.token);

                    trace!("sending keepalive to {}", link.remote());
                    if let Err(e) = link.send(&frame).await {
                        debug!("keepalive to {} failed: {}", link.remote(), e);
                        self.remove_link(&link).await;
                        return;
                    }
                }
            }
        }
    }

    /// Remove a link from the pool, but only if the pool still holds
    /// this exact link (the slot may have been re-dialled meanwhile).
    async fn remove_link(&self, link: &Link) {
        let mut state = self.state.write().await;
        let remote = link.remote();
        if state
            .links
            .get(&remote)
            .map(|l| l.id() == link.id())
            .unwrap_or(false)
        {
            state.links.remove(&remote);
        }
    }

    /// Per-link receive loop.
    async fn listen_link(self: Arc<Self>, link: Arc<Link>) {
        let remote = link.remote();
        match self.link_loop(&link).await {
            Ok(()) => debug!("link {} closed", remote),
            Err(e) => debug!("link {} terminated: {}", remote, e),
        }
        self.remove_link(&link).await;
        link.close().await;
    }

    async fn link_loop(&self, link: &Arc<Link>) -> TunnelResult<()> {
        loop {
            let mut frame = link.recv().await?;

            // always ensure we have the correct auth token
            let token = frame.header(HEADER_TUNNEL_TOKEN).unwrap_or_default();
            if token != self.token {
                warn!("link {} sent an invalid token", link.remote());
                return Err(TunnelError::InvalidToken);
            }

            let kind = frame
                .header(HEADER_TUNNEL)
                .and_then(MessageKind::parse);

            match kind {
                Some(MessageKind::Connect) => {
                    let id = frame.header(HEADER_TUNNEL_ID).unwrap_or_default();
                    if id == self.id {
                        // we connected to ourselves
                        link.set_loopback(true);
                    }
                    link.set_connected(true);
                    let mut state = self.state.write().await;
                    state.links.insert(link.remote(), link.clone());
                    continue;
                }
                Some(MessageKind::Close) => return Ok(()),
                Some(MessageKind::KeepAlive) => {
                    trace!("keepalive from {}", link.remote());
                    link.mark_keep_alive();
                    continue;
                }
                Some(MessageKind::Message) => {}
                None => continue,
            }

            if !link.is_connected() {
                return Err(TunnelError::LinkNotConnected);
            }

            let channel = frame
                .header(HEADER_TUNNEL_CHANNEL)
                .unwrap_or_default()
                .to_string();
            let session_id = frame
                .header(HEADER_TUNNEL_SESSION)
                .unwrap_or_default()
                .to_string();

            frame.strip_tunnel_headers();

            if channel.is_empty() || session_id.is_empty() {
                continue;
            }

            self.deliver(link, channel, session_id, frame).await;
        }
    }

    /// Route one inbound payload message to its session.
    async fn deliver(&self, link: &Arc<Link>, channel: String, session_id: String, frame: Frame) {
        // a loopback link always feeds the listening side of the channel
        let entry = {
            let state = self.state.read().await;
            if link.is_loopback() {
                let key = SessionKey::listener(&channel);
                state.sessions.get(&key).map(|e| (key, e.clone()))
            } else {
                let key = SessionKey::from_wire(&channel, &session_id);
                match state.sessions.get(&key) {
                    Some(e) => Some((key, e.clone())),
                    None => {
                        let key = SessionKey::listener(&channel);
                        state.sessions.get(&key).map(|e| (key, e.clone()))
                    }
                }
            }
        };

        let Some((key, entry)) = entry else {
            trace!("no session for {}:{}, dropping", channel, session_id);
            return;
        };

        if entry.shared.is_closed() {
            self.state.write().await.sessions.remove(&key);
            return;
        }

        entry.shared.mark_opened(&link.remote());

        let msg = InboundMessage {
            channel,
            session_id,
            link: link.id().to_string(),
            loopback: link.is_loopback(),
            remote: link.remote(),
            frame,
        };

        // best-effort: a full session queue drops the message
        if entry.recv_tx.try_send(msg).is_err() {
            debug!(
                "session {}:{} queue full, dropping message",
                key.channel(),
                key.session_id()
            );
        }
    }

    /// Outbound fan-out: consume the shared send queue and broadcast
    /// each message across eligible links. The queue outlives connect
    /// epochs; each epoch runs its own consumer task.
    async fn process(self: Arc<Self>, mut closed_rx: watch::Receiver<bool>) {
        loop {
            let msg = {
                let mut send_rx = self.send_rx.lock().await;
                tokio::select! {
                    _ = closed_rx.wait_for(|c| *c) => return,
                    msg = send_rx.recv() => msg,
                }
            };
            match msg {
                Some(msg) => self.broadcast(msg).await,
                None => return,
            }
        }
    }

    async fn broadcast(&self, msg: OutboundMessage) {
        let mut frame = msg.frame;
        frame.set_header(HEADER_TUNNEL, msg.kind.as_str());
        frame.set_header(HEADER_TUNNEL_ID, msg.tunnel_id);
        frame.set_header(HEADER_TUNNEL_CHANNEL, msg.channel);
        frame.set_header(HEADER_TUNNEL_SESSION, msg.session_id);
        frame.set_header(HEADER_TUNNEL_TOKEN, &self.token);

        let links: Vec<Arc<Link>> = {
            let state = self.state.read().await;
            state.links.values().cloned().collect()
        };

        if links.is_empty() {
            debug!("no links to send to");
        }

        let mut sent = false;
        let mut last_err: Option<TunnelError> = None;
        let mut failed: Vec<Arc<Link>> = Vec::new();

        for link in links {
            if !link.is_connected() {
                last_err = Some(TunnelError::LinkNotConnected);
                continue;
            }
            // a message received via a listener is pinned to the link
            // it arrived on
            if !msg.link.is_empty() && link.id() != msg.link {
                last_err = Some(TunnelError::LinkNotFound);
                continue;
            }
            // never send dialled traffic back over a loopback link
            if link.is_loopback() && msg.outbound {
                last_err = Some(TunnelError::LinkLoopback);
                continue;
            }
            // loopback returns travel only over the loopback link
            if msg.loopback && !link.is_loopback() {
                last_err = Some(TunnelError::LinkNotLoopback);
                continue;
            }
            if let Err(e) = link.send(&frame).await {
                debug!("send to {} failed: {}", link.remote(), e);
                last_err = Some(e);
                failed.push(link);
                continue;
            }
            sent = true;
        }

        for link in failed {
            self.remove_link(&link).await;
        }

        let result = if sent || last_err.is_none() {
            Ok(())
        } else {
            Err(last_err.unwrap())
        };

        if let Some(err_tx) = msg.err_tx {
            let _ = err_tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransport;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config(token: &str, nodes: Vec<String>) -> TunnelConfig {
        TunnelConfig {
            token: token.to_string(),
            address: "127.0.0.1:0".to_string(),
            nodes,
            reconnect_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn new_tunnel(token: &str, nodes: Vec<String>) -> Arc<Tunnel> {
        Arc::new(Tunnel::new(
            test_config(token, nodes),
            Arc::new(TcpTransport::new()),
        ))
    }

    #[tokio::test]
    async fn test_connect_and_close_are_idempotent() {
        let tunnel = new_tunnel("t", vec![]);
        tunnel.connect().await.unwrap();
        tunnel.connect().await.unwrap();
        tunnel.close().await.unwrap();
        tunnel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let tunnel = new_tunnel("t", vec![]);
        tunnel.connect().await.unwrap();

        let _listener = tunnel.listen("test").await.unwrap();
        assert!(matches!(
            tunnel.listen("test").await,
            Err(TunnelError::AlreadyListening(_))
        ));

        tunnel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_two_node_message_flow() {
        let a = new_tunnel("secret", vec![]);
        a.connect().await.unwrap();
        let addr = a.address().await;

        let listener = a.listen("test").await.unwrap();

        let b = new_tunnel("secret", vec![addr]);
        b.connect().await.unwrap();

        let session = b.dial("test").await.unwrap();
        let mut frame = Frame::with_body(b"hello".to_vec());
        frame.set_header("X-Case", "two-node");
        session.send(frame).await.unwrap();

        let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let got = timeout(WAIT, server.recv()).await.unwrap().unwrap();
        assert_eq!(got.body, b"hello");
        assert_eq!(got.header("X-Case"), Some("two-node"));
        // tunnel control headers never reach a session
        assert!(got.headers.keys().all(|k| !k.starts_with("Micro-Tunnel")));

        server.send(Frame::with_body(b"world".to_vec())).await.unwrap();
        let reply = timeout(WAIT, session.recv()).await.unwrap().unwrap();
        assert_eq!(reply.body, b"world");

        assert_eq!(a.links().await.len(), 1);
        assert_eq!(b.links().await.len(), 1);

        b.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_loopback_routing() {
        let tunnel = new_tunnel("t", vec![]);
        tunnel.connect().await.unwrap();
        let addr = tunnel.address().await;
        tunnel.init_nodes(vec![addr]);

        // the monitor dials our own address; the accepted side of that
        // connection observes our own id and becomes loopback
        let mut saw_loopback = false;
        for _ in 0..50 {
            if tunnel.links().await.iter().any(|l| l.loopback) {
                saw_loopback = true;
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        assert!(saw_loopback, "no loopback link established");

        let listener = tunnel.listen("loop").await.unwrap();
        let session = tunnel.dial("loop").await.unwrap();

        session.send(Frame::with_body(b"ping".to_vec())).await.unwrap();

        let server = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let got = timeout(WAIT, server.recv()).await.unwrap().unwrap();
        assert_eq!(got.body, b"ping");

        server.send(Frame::with_body(b"pong".to_vec())).await.unwrap();
        let reply = timeout(WAIT, session.recv()).await.unwrap().unwrap();
        assert_eq!(reply.body, b"pong");

        tunnel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_mismatch_rejects_link() {
        let a = new_tunnel("t1", vec![]);
        a.connect().await.unwrap();
        let addr = a.address().await;

        let b = new_tunnel("t2", vec![addr]);
        b.connect().await.unwrap();

        // the handshake carries b's token; a must refuse to save the link
        sleep(Duration::from_millis(500)).await;
        assert!(a.links().await.is_empty());

        b.close().await.unwrap();
        a.close().await.unwrap();
    }
}
