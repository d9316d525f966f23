//! Link state
//!
//! One authenticated transport connection to a peer. A link is shared
//! between its receive loop, its keepalive loop and the outbound fan-out,
//! so the mutable state lives in atomics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use uuid::Uuid;

use crate::error::TunnelResult;
use crate::message::Frame;
use crate::transport::Socket;

pub(crate) struct Link {
    id: String,
    socket: Arc<dyn Socket>,
    connected: AtomicBool,
    loopback: AtomicBool,
    last_keep_alive: Mutex<Instant>,
}

impl Link {
    pub fn new(socket: Arc<dyn Socket>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            socket,
            connected: AtomicBool::new(false),
            loopback: AtomicBool::new(false),
            last_keep_alive: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote(&self) -> String {
        self.socket.remote()
    }

    pub async fn send(&self, frame: &Frame) -> TunnelResult<()> {
        self.socket.send(frame).await
    }

    pub async fn recv(&self) -> TunnelResult<Frame> {
        self.socket.recv().await
    }

    pub async fn close(&self) {
        self.socket.close().await;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_loopback(&self) -> bool {
        self.loopback.load(Ordering::SeqCst)
    }

    pub fn set_loopback(&self, loopback: bool) {
        self.loopback.store(loopback, Ordering::SeqCst);
    }

    pub fn mark_keep_alive(&self) {
        *self.last_keep_alive.lock().unwrap() = Instant::now();
    }

    pub fn last_keep_alive(&self) -> Instant {
        *self.last_keep_alive.lock().unwrap()
    }
}
