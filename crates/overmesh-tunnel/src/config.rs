//! Tunnel configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{KEEPALIVE_INTERVAL_SECS, RECONNECT_INTERVAL_SECS};

/// Tunnel configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Unique tunnel id (empty = generate a fresh UUID)
    pub id: String,

    /// Shared token; messages carrying a different token kill the link
    pub token: String,

    /// Bind address for the transport listener (port 0 = ephemeral)
    pub address: String,

    /// Seed node addresses to dial on connect
    pub nodes: Vec<String>,

    /// Interval between keepalives on outbound links
    pub keepalive_interval: Duration,

    /// Interval between reconnect attempts to missing seed nodes
    pub reconnect_interval: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            token: "overmesh".to_string(),
            address: "0.0.0.0:0".to_string(),
            nodes: Vec::new(),
            keepalive_interval: Duration::from_secs(KEEPALIVE_INTERVAL_SECS),
            reconnect_interval: Duration::from_secs(RECONNECT_INTERVAL_SECS),
        }
    }
}

impl TunnelConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.address.is_empty() {
            return Err("bind address must not be empty".into());
        }
        if self.keepalive_interval.is_zero() {
            return Err("keepalive interval must be > 0".into());
        }
        if self.reconnect_interval.is_zero() {
            return Err("reconnect interval must be > 0".into());
        }
        Ok(())
    }
}
