//! Configuration loading from `~/.duplex/config.toml` with defaults.

use crate::frame::MAX_FRAME_SIZE;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Tunables shared by channels and orchestrators.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Largest length-prefixed frame accepted on stream transports.
    pub max_frame_size: u32,
    /// Largest datagram sent or accepted on UDP transports.
    pub max_datagram_size: usize,
    /// Frames buffered per channel before the receive loop applies backpressure.
    pub inbound_queue_capacity: usize,
    /// Capacity of the lifecycle and orchestrator event broadcasts.
    pub event_capacity: usize,
    /// Upper bound on the whole handshake exchange; 0 disables the limit.
    pub handshake_timeout_secs: u64,
    /// How long a pipe parent waits for its child to exit after closing.
    pub child_exit_timeout_secs: u64,
    /// Requests kept waiting for a response; the oldest is evicted beyond this.
    pub max_pending_requests: usize,
    /// Endpoint acceptance policy for server-side transports.
    pub policy: PolicyConfig,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            inbound_queue_capacity: 256,
            event_capacity: 1024,
            handshake_timeout_secs: 30,
            child_exit_timeout_secs: 5,
            max_pending_requests: 1024,
            policy: PolicyConfig::default(),
        }
    }
}

impl WireConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_secs > 0).then(|| Duration::from_secs(self.handshake_timeout_secs))
    }

    pub fn child_exit_timeout(&self) -> Duration {
        Duration::from_secs(self.child_exit_timeout_secs)
    }
}

/// Endpoint acceptance settings, turned into an
/// [`EndpointPolicy`](crate::policy::EndpointPolicy) at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Maximum live logical channels per server.
    pub max_channels: usize,
    /// Remote addresses that are always refused.
    pub banned: Vec<IpAddr>,
    /// Per-address datagram quota; unset means unlimited.
    pub datagrams_per_second: Option<u32>,
    /// Logical channels silent for longer than this are dropped on re-evaluation.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_channels: 1024,
            banned: Vec::new(),
            datagrams_per_second: None,
            idle_timeout_secs: None,
        }
    }
}

/// Default config location: `~/.duplex/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".duplex")
        .join("config.toml")
}

/// Load wire configuration from a TOML file, with defaults.
///
/// A missing, unreadable or invalid file is logged and replaced by
/// [`WireConfig::default`].
pub fn load_config(path: Option<&Path>) -> WireConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return WireConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<WireConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                WireConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            WireConfig::default()
        }
    }
}
