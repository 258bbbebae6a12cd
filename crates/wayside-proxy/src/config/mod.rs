//! Configuration types for the Wayside proxy.

mod listen;
mod mitm;
mod upstream;

use std::path::Path;

use hyper::Uri;
use serde::{Deserialize, Serialize};

pub use listen::{ListenConfig, MetricsConfig};
pub use mitm::MitmConfig;
pub use upstream::{ConnectionPoolConfig, TimeoutsConfig, UpstreamTlsConfig};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Forward all traffic through this HTTP proxy (`http://host:port`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_proxy: Option<String>,

    /// Decrypt CONNECT traffic with a local CA. Tunnels are opaque when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitm: Option<MitmConfig>,

    #[serde(default)]
    pub upstream_tls: UpstreamTlsConfig,
    #[serde(default)]
    pub connection_pool: ConnectionPoolConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, anyhow::Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.timeouts.request_secs == 0 {
            anyhow::bail!("timeouts.request_secs must be greater than zero");
        }
        if self.timeouts.connect_secs == 0 {
            anyhow::bail!("timeouts.connect_secs must be greater than zero");
        }

        if self.metrics.enabled && self.metrics.port == self.listen.address.port() {
            anyhow::bail!(
                "metrics.port {} collides with the proxy listener",
                self.metrics.port
            );
        }

        self.downstream_proxy_uri()?;

        if let Some(ref mitm) = self.mitm {
            if mitm.validity_days == 0 {
                anyhow::bail!("mitm.validity_days must be greater than zero");
            }
        }

        Ok(())
    }

    /// The parsed downstream proxy, if one is configured.
    pub fn downstream_proxy_uri(&self) -> Result<Option<Uri>, anyhow::Error> {
        let Some(ref raw) = self.downstream_proxy else {
            return Ok(None);
        };
        let uri: Uri = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid downstream_proxy '{raw}': {e}"))?;
        if uri.scheme_str() != Some("http") {
            anyhow::bail!("downstream_proxy '{raw}' must use the http:// scheme");
        }
        if uri.host().is_none() || uri.port_u16().is_none() {
            anyhow::bail!("downstream_proxy '{raw}' must be of the form http://host:port");
        }
        Ok(Some(uri))
    }
}
