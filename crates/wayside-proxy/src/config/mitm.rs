//! TLS interception settings.

use crate::mitm::DEFAULT_VALIDITY_DAYS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MitmConfig {
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    /// Create and persist a CA when neither file exists.
    #[serde(default = "default_generate_if_missing")]
    pub generate_if_missing: bool,
    /// Lifetime of issued leaf certificates.
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
}

fn default_generate_if_missing() -> bool {
    true
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

impl MitmConfig {
    /// Interception with the given CA files and default settings.
    pub fn new(ca_cert_path: impl Into<PathBuf>, ca_key_path: impl Into<PathBuf>) -> Self {
        Self {
            ca_cert_path: ca_cert_path.into(),
            ca_key_path: ca_key_path.into(),
            generate_if_missing: default_generate_if_missing(),
            validity_days: default_validity_days(),
        }
    }
}
