//! Wayside: an intercepting HTTP/HTTPS proxy engine.
//!
//! Build a [`proxy::Proxy`], plug in request/response modifiers and
//! optionally a [`mitm::Mitm`] implementation, then hand it a listener.

pub mod config;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod mitm;
pub mod proxy;

pub use error::{BoxError, ProxyError};
pub use proxy::Proxy;
