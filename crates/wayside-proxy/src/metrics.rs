//! Prometheus metrics for the Wayside proxy.
//!
//! Tracks accepted connections, request outcomes, tunnels and interception,
//! and serves them on `/metrics`.
use crate::cors::CorsLayer;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::{service_fn, Layer};
use tracing::{debug, info};

lazy_static! {
    /// Connections handed to a connection handler
    pub static ref CONNECTIONS_ACCEPTED_TOTAL: IntCounter = register_int_counter!(
        "wayside_connections_accepted_total",
        "Total number of client connections accepted"
    )
    .unwrap();

    /// Client connections currently being served
    pub static ref ACTIVE_CONNECTIONS: IntGauge = register_int_gauge!(
        "wayside_active_connections",
        "Number of client connections currently being served"
    )
    .unwrap();

    /// Responses written to clients
    pub static ref REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "wayside_requests_total",
        "Total number of responses written by the proxy",
        &["method", "status"]
    )
    .unwrap();

    /// Round trips or dials that ended in a synthesized 502
    pub static ref ROUND_TRIP_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "wayside_round_trip_errors_total",
        "Total number of failed upstream round trips"
    )
    .unwrap();

    /// CONNECT requests by how they were handled
    pub static ref TUNNELS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "wayside_tunnels_total",
        "Total number of CONNECT requests handled",
        &["kind"]  // kind: direct|downstream|mitm
    )
    .unwrap();

    /// Client-side handshakes on intercepted tunnels
    pub static ref MITM_HANDSHAKES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "wayside_mitm_handshakes_total",
        "Total number of TLS interception handshakes",
        &["result"]  // result: ok|error|plaintext
    )
    .unwrap();

    /// Modifier failures turned into Warning headers
    pub static ref MODIFIER_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "wayside_modifier_errors_total",
        "Total number of request/response modifier errors",
        &["phase"]  // phase: request|response
    )
    .unwrap();
}

/// Collect and return all metrics in Prometheus text format
pub fn collect_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {e}");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_request(method: &str, status: u16) {
    REQUESTS_TOTAL
        .with_label_values(&[method, &status.to_string()])
        .inc();
}

pub fn record_tunnel(kind: &str) {
    TUNNELS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn record_mitm_handshake(result: &str) {
    MITM_HANDSHAKES_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_modifier_error(phase: &str) {
    MODIFIER_ERRORS_TOTAL.with_label_values(&[phase]).inc();
}

/// Keeps the active-connection gauge in step with a handler's lifetime.
pub struct ActiveConnectionGuard(());

impl ActiveConnectionGuard {
    pub fn new() -> Self {
        CONNECTIONS_ACCEPTED_TOTAL.inc();
        ACTIVE_CONNECTIONS.inc();
        Self(())
    }
}

impl Default for ActiveConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        ACTIVE_CONNECTIONS.dec();
    }
}

/// Serves the Prometheus text format on `/metrics`.
///
/// Browser dashboards can scrape it cross-origin; responses carry CORS
/// headers whenever the request has an `Origin`.
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Accept scrapes until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Metrics endpoint listening on http://{}/metrics", self.addr);

        loop {
            let (stream, _) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => accepted?,
            };
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service = CorsLayer::new().layer(service_fn(metrics_endpoint));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(io, TowerToHyperService::new(service))
                    .await
                {
                    debug!("Metrics connection error: {}", e);
                }
            });
        }
    }
}

async fn metrics_endpoint(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(render(req.method(), req.uri().path()))
}

fn render(method: &Method, path: &str) -> Response<Full<Bytes>> {
    if method != Method::GET || path != "/metrics" {
        let mut res = Response::new(Full::new(Bytes::from_static(b"not found")));
        *res.status_mut() = StatusCode::NOT_FOUND;
        return res;
    }
    let mut res = Response::new(Full::new(Bytes::from(collect_metrics())));
    res.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    res
}
