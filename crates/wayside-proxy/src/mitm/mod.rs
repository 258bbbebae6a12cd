//! TLS interception.
//!
//! [`Mitm`] is the seam the engine uses to terminate TLS for a CONNECT
//! target; [`CertificateAuthority`] is the bundled implementation that mints
//! a leaf certificate per host from a locally trusted root.

mod authority;

pub use authority::{CertificateAuthority, DEFAULT_VALIDITY_DAYS};

use crate::error::BoxError;
use hyper::http::request;
use rustls::ServerConfig;
use std::io;
use std::sync::Arc;
use tracing::warn;

pub trait Mitm: Send + Sync {
    /// TLS server configuration presented to clients connecting to `host`.
    fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, BoxError>;

    /// Called when the client side of an intercepted handshake fails.
    fn handshake_error(&self, parts: &request::Parts, err: &io::Error) {
        warn!(uri = %parts.uri, error = %err, "MITM handshake failed");
    }
}
