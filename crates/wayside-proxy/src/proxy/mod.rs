//! Proxy engine.
//!
//! # Module Structure
//!
//! - `server` - [`Proxy`] handle, settings and the accept loop
//! - `handler` - per-connection request loop
//! - `connect` - CONNECT tunnels and TLS interception
//! - `session` - sessions, per-request contexts and hijacking
//! - `modifier` - request/response interception hooks
//! - `transport` - round-tripper and dialer seams, pooled HTTP client
//! - `http1` - client-facing HTTP/1.x codec
//! - `shaping` - traffic-shaping hook
//! - `network` - listener binding (SO_REUSEPORT)

mod connect;
mod connection;
mod handler;
mod headers;
mod http1;
mod lifecycle;
mod modifier;
mod network;
mod response_ext;
mod server;
mod session;
mod shaping;
mod tls;
mod transport;

#[cfg(test)]
mod tests;

pub use connection::{Connection, Listener, RemoteAddr, Rewind, TlsInfo};
pub use headers::{WarningHeadersExt, WARN_AGENT};
pub use http1::{read_request, read_response};
pub use modifier::{Noop, RequestModifier, ResponseModifier};
pub use network::bind_listener;
pub use response_ext::{empty, full, IntoProxyBody, ProxyBody};
pub use server::{Proxy, DEFAULT_TIMEOUT, KEEPALIVE_PERIOD};
pub use session::{
    Context, ContextId, ContextRegistry, Hijacked, HijackedConnection, LinkGuard, RequestId,
    Session, SessionId,
};
pub use shaping::{
    Bucket, NextAction, ShapingAction, ShapingContext, ShapingRule, ThrottleDecision,
    TrafficShaper,
};
pub use tls::{certs_from_pem, NoVerifier};
pub use transport::{Dialer, HttpTransport, RoundTripper, TcpDialer, TransportOptions};
