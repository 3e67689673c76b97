//! Discovery configuration.
//!
//! Loaded from TOML; every field has a default so partial files are accepted.
//!
//! ```toml
//! root_path = "/cluster"
//! session_timeout = "10s"
//! join_timeout = "0s"          # 0 waits forever
//! ack_threshold = 5
//!
//! [resolver]
//! type = "default"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{DiscoveryError, Result};

/// Operational parameters of a discovery node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Root of the discovery layout in the coordination service.
    pub root_path: String,
    /// Coordination session timeout. A node silent for longer is considered failed.
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    /// How long a join (or a client reconnect) may wait for a coordinator.
    /// Zero waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub join_timeout: Duration,
    /// Client nodes segment instead of reconnecting after losing the cluster.
    pub client_reconnect_disabled: bool,
    /// Applied events buffered before acknowledgments are flushed. 1 acks every event.
    pub ack_threshold: usize,
    /// Upper bound on how long an applied event may stay unacknowledged.
    #[serde(with = "humantime_serde")]
    pub ack_flush_interval: Duration,
    /// How long a resolution round waits for connectivity reports.
    #[serde(with = "humantime_serde")]
    pub resolution_timeout: Duration,
    /// Transport-level timeout for a single ping.
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Safety-net reconcile period of the coordinator and watcher loops.
    #[serde(with = "humantime_serde")]
    pub coordinator_tick: Duration,
    /// Discovery events remembered locally for `history()`.
    pub event_history_limit: usize,
    /// Communication problem resolver run by the coordinator.
    pub resolver: ResolverConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root_path: "/discovery".to_string(),
            session_timeout: Duration::from_secs(10),
            join_timeout: Duration::ZERO,
            client_reconnect_disabled: false,
            ack_threshold: 5,
            ack_flush_interval: Duration::from_millis(500),
            resolution_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_millis(500),
            coordinator_tick: Duration::from_millis(100),
            event_history_limit: 1000,
            resolver: ResolverConfig::default(),
        }
    }
}

/// Resolver selection, fixed at configuration time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolverConfig {
    /// Never kills anything.
    #[serde(rename = "noop")]
    NoOp,
    /// Kills the current coordinator.
    KillCoordinator,
    /// Kills a random subset, at most half of the participants.
    KillRandom,
    /// Keeps the largest fully connected group of servers.
    #[default]
    Default,
}

impl DiscoveryConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: DiscoveryConfig =
            toml::from_str(contents).map_err(|e| DiscoveryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            DiscoveryError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        tracing::info!("Loaded discovery configuration from {}", path.display());
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DiscoveryError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root_path.starts_with('/') {
            return Err(DiscoveryError::Config(format!(
                "root_path must be absolute, got {:?}",
                self.root_path
            )));
        }
        if self.session_timeout.is_zero() {
            return Err(DiscoveryError::Config(
                "session_timeout must be positive".to_string(),
            ));
        }
        if self.ack_threshold == 0 {
            return Err(DiscoveryError::Config(
                "ack_threshold must be at least 1".to_string(),
            ));
        }
        if self.coordinator_tick.is_zero() || self.ack_flush_interval.is_zero() {
            return Err(DiscoveryError::Config(
                "coordinator_tick and ack_flush_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `None` when joins may wait forever.
    pub fn join_deadline(&self) -> Option<Duration> {
        if self.join_timeout.is_zero() {
            None
        } else {
            Some(self.join_timeout)
        }
    }
}
