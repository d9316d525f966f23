//! Network configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Network overlay configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Unique node id (empty = generate a fresh UUID)
    pub id: String,

    /// Network name, also the name handed to the resolver
    pub name: String,

    /// Seed node addresses, merged with resolver records
    pub nodes: Vec<String>,

    /// Interval between resolver refreshes of the seed set
    pub resolve_interval: Duration,

    /// Interval between neighbourhood announcements
    pub announce_interval: Duration,

    /// Neighbours silent for longer than this are pruned
    pub prune_interval: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "overmesh".to_string(),
            nodes: Vec::new(),
            resolve_interval: Duration::from_secs(60),
            announce_interval: Duration::from_secs(30),
            prune_interval: Duration::from_secs(90),
        }
    }
}

impl NetworkConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("network name must not be empty".into());
        }
        if self.resolve_interval.is_zero()
            || self.announce_interval.is_zero()
            || self.prune_interval.is_zero()
        {
            return Err("timer intervals must be > 0".into());
        }
        if self.announce_interval >= self.prune_interval {
            return Err("announce interval must be shorter than prune interval".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_announce_must_beat_prune() {
        let config = NetworkConfig {
            announce_interval: Duration::from_secs(120),
            prune_interval: Duration::from_secs(90),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
