//! The [`Proxy`] handle: configuration setters, the accept loop and shutdown.

use super::connection::Listener;
use super::handler;
use super::lifecycle::Lifecycle;
use super::modifier::{Noop, RequestModifier, ResponseModifier};
use super::session::{Context, ContextRegistry};
use super::transport::{Dialer, HttpTransport, RoundTripper, TcpDialer, TransportOptions};
use crate::error::{is_transient_accept_error, ProxyError};
use crate::mitm::Mitm;
use hyper::{Request, Uri};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Per-cycle snapshot of everything a setter can change.
#[derive(Clone)]
pub(crate) struct Settings {
    pub round_tripper: Arc<dyn RoundTripper>,
    pub dialer: Arc<dyn Dialer>,
    pub timeout: Duration,
    pub downstream_proxy: Option<Uri>,
    pub mitm: Option<Arc<dyn Mitm>>,
    pub request_modifier: Arc<dyn RequestModifier>,
    pub response_modifier: Arc<dyn ResponseModifier>,
    custom_round_tripper: bool,
    transport_options: TransportOptions,
}

impl Settings {
    fn rebuild_transport(&mut self) {
        if !self.custom_round_tripper {
            self.round_tripper = Arc::new(HttpTransport::new(
                Arc::clone(&self.dialer),
                self.downstream_proxy.clone(),
                &self.transport_options,
            ));
        }
    }
}

pub(crate) struct Shared {
    settings: RwLock<Settings>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) registry: Arc<ContextRegistry>,
}

/// An intercepting HTTP proxy.
///
/// Cheap to clone; clones share configuration and lifecycle, so one clone can
/// [`serve`](Proxy::serve) while another calls [`close`](Proxy::close).
#[derive(Clone)]
pub struct Proxy {
    pub(crate) shared: Arc<Shared>,
}

impl Default for Proxy {
    fn default() -> Self {
        Self::new()
    }
}

impl Proxy {
    /// A proxy with a direct TCP dialer, the pooled HTTP transport, a
    /// 5-minute request timeout and no-op modifiers.
    pub fn new() -> Self {
        Self::with_transport_options(TransportOptions::default())
    }

    pub fn with_transport_options(options: TransportOptions) -> Self {
        let dialer: Arc<dyn Dialer> = Arc::new(TcpDialer::default());
        let round_tripper = Arc::new(HttpTransport::new(Arc::clone(&dialer), None, &options));
        let settings = Settings {
            round_tripper,
            dialer,
            timeout: DEFAULT_TIMEOUT,
            downstream_proxy: None,
            mitm: None,
            request_modifier: Arc::new(Noop),
            response_modifier: Arc::new(Noop),
            custom_round_tripper: false,
            transport_options: options,
        };
        Self {
            shared: Arc::new(Shared {
                settings: RwLock::new(settings),
                lifecycle: Lifecycle::new(),
                registry: ContextRegistry::new(),
            }),
        }
    }

    /// Replace the transport used for non-CONNECT round trips.
    pub fn set_round_tripper(&self, round_tripper: Arc<dyn RoundTripper>) {
        let mut settings = self.shared.settings.write();
        settings.round_tripper = round_tripper;
        settings.custom_round_tripper = true;
    }

    /// Send all traffic through an HTTP proxy, or directly when `None`.
    pub fn set_downstream_proxy(&self, proxy: Option<Uri>) {
        let mut settings = self.shared.settings.write();
        settings.downstream_proxy = proxy;
        settings.rebuild_transport();
    }

    /// Deadline applied to reading each request and writing its response.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.settings.write().timeout = timeout;
    }

    /// Enable TLS interception of CONNECT tunnels.
    pub fn set_mitm(&self, mitm: Option<Arc<dyn Mitm>>) {
        self.shared.settings.write().mitm = mitm;
    }

    /// Replace how outbound connections are opened.
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        let mut settings = self.shared.settings.write();
        settings.dialer = dialer;
        settings.rebuild_transport();
    }

    pub fn set_request_modifier(&self, modifier: Arc<dyn RequestModifier>) {
        self.shared.settings.write().request_modifier = modifier;
    }

    pub fn set_response_modifier(&self, modifier: Arc<dyn ResponseModifier>) {
        self.shared.settings.write().response_modifier = modifier;
    }

    pub(crate) fn settings(&self) -> Settings {
        self.shared.settings.read().clone()
    }

    /// Context of a request currently moving through the engine.
    pub fn context_for<B>(&self, req: &Request<B>) -> Option<Arc<Context>> {
        self.shared.registry.get(req)
    }

    /// Whether [`close`](Proxy::close) has been called.
    pub fn closing(&self) -> bool {
        self.shared.lifecycle.closing()
    }

    /// Connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.shared.lifecycle.active()
    }

    /// Stop accepting, then wait for every in-flight connection to finish.
    pub async fn close(&self) {
        info!("Shutting down proxy");
        self.shared.lifecycle.close().await;
    }

    /// Accept and serve connections until shutdown or a fatal accept error.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<(), ProxyError> {
        let token = self.shared.lifecycle.token().clone();
        match listener.local_addr() {
            Ok(addr) => info!("Proxy listening on http://{}", addr),
            Err(e) => debug!("Proxy listening on unknown address: {}", e),
        }

        let mut backoff = Duration::ZERO;
        loop {
            if self.closing() {
                info!("Accept loop stopped");
                return Ok(());
            }

            let accepted = tokio::select! {
                _ = token.cancelled() => continue,
                result = listener.accept() => result,
            };

            match accepted {
                Ok((conn, peer_addr)) => {
                    backoff = Duration::ZERO;
                    if let Err(e) = conn.set_keepalive(KEEPALIVE_PERIOD) {
                        debug!(%peer_addr, "Failed to enable keep-alive: {}", e);
                    }
                    let proxy = self.clone();
                    let spawned = self.shared.lifecycle.try_spawn(async move {
                        handler::serve_connection(proxy, conn, peer_addr).await;
                    });
                    if !spawned {
                        debug!(%peer_addr, "Dropped connection accepted during shutdown");
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    backoff = next_backoff(backoff);
                    warn!("Accept error: {}; retrying in {:?}", e, backoff);
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    error!("Fatal accept error: {}", e);
                    return Err(ProxyError::Accept(e));
                }
            }
        }
    }
}

/// 5ms, doubling, capped at 1s.
pub(crate) fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        MIN_BACKOFF
    } else {
        (current * 2).min(MAX_BACKOFF)
    }
}
