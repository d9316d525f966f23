//! Channel listener
//!
//! A listener owns the reserved listener session of a channel. Its
//! dispatch task watches that session's inbound queue and spawns one
//! server-side session per unseen remote session id; new sessions are
//! handed to `accept()`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use crate::error::{TunnelError, TunnelResult};
use crate::session::{
    InboundMessage, Session, SessionKey, SessionOptions, SessionShared, RECV_BACKLOG,
};

/// Capacity of the pending-accept queue
const ACCEPT_BACKLOG: usize = 128;

/// Accepts server-side sessions on a tunnel channel
pub struct TunnelListener {
    channel: String,
    accept: Mutex<mpsc::Receiver<Session>>,
    session: Arc<SessionShared>,
}

impl TunnelListener {
    pub(crate) fn new(channel: &str, listener_session: Session) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let shared = listener_session.shared.clone();

        tokio::spawn(dispatch(channel.to_string(), listener_session, accept_tx));

        Self {
            channel: channel.to_string(),
            accept: Mutex::new(accept_rx),
            session: shared,
        }
    }

    /// Channel this listener is bound to
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Accept the next inbound session
    pub async fn accept(&self) -> TunnelResult<Session> {
        self.accept
            .lock()
            .await
            .recv()
            .await
            .ok_or(TunnelError::Closed)
    }

    /// Stop listening. Idempotent.
    pub fn close(&self) {
        self.session.close();
    }
}

/// Per-listener demultiplexer: one pseudo session per remote session id.
async fn dispatch(channel: String, listener: Session, accept_tx: mpsc::Sender<Session>) {
    let mut conns: HashMap<String, (Arc<SessionShared>, mpsc::Sender<InboundMessage>)> =
        HashMap::new();

    loop {
        let msg = match listener.recv_message().await {
            Ok(msg) => msg,
            Err(_) => {
                debug!("listener on {} shutting down", channel);
                return;
            }
        };

        let session_id = msg.session_id.clone();

        let (shared, tx) = match conns.get(&session_id) {
            Some((shared, tx)) => (shared.clone(), tx.clone()),
            None => {
                trace!("new session {} on channel {}", session_id, channel);
                let (tx, rx) = mpsc::channel(RECV_BACKLOG);
                let shared = Arc::new(SessionShared::new(SessionOptions {
                    tunnel_id: listener.shared.tunnel_id.clone(),
                    key: SessionKey::stream(&channel, &session_id),
                    local: channel.clone(),
                    remote: msg.remote.clone(),
                    outbound: false,
                    // replies to a loopback sender must stay on the
                    // loopback link, pinned to the link it came in on
                    loopback: msg.loopback,
                    link: msg.link.clone(),
                    opened: true,
                }));
                let session = Session {
                    shared: shared.clone(),
                    recv: Mutex::new(rx),
                    send: listener.send.clone(),
                };
                if accept_tx.send(session).await.is_err() {
                    return;
                }
                conns.insert(session_id.clone(), (shared.clone(), tx.clone()));
                (shared, tx)
            }
        };

        let mut closed = shared.subscribe_closed();
        tokio::select! {
            _ = closed.wait_for(|c| *c) => {
                conns.remove(&session_id);
            }
            res = tx.send(msg) => {
                if res.is_err() {
                    conns.remove(&session_id);
                }
            }
        }
    }
}
