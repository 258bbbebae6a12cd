//! Upstream connection settings: timeouts, pooling and origin TLS.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    /// Per-request deadline on client connections.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
}

impl TimeoutsConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            connect_secs: default_connect_secs(),
        }
    }
}

fn default_request_secs() -> u64 {
    300
}

fn default_connect_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpstreamTlsConfig {
    /// Accept any origin certificate (development/testing only).
    #[serde(default)]
    pub skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionPoolConfig {
    #[serde(default = "default_pool_max_idle_per_host")]
    pub max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: default_pool_max_idle_per_host(),
            idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_pool_idle_timeout() -> u64 {
    90
}
