//! Per-connection request loop.
//!
//! Each accepted connection runs [`serve_connection`], which drives one
//! [`handle`] cycle per request. A cycle ends in an [`Outcome`]; the loop
//! applies it, including swapping the stream for a TLS stream after a MITM
//! handshake, so cycles never recurse.

use super::connect;
use super::connection::{Connection, RemoteAddr, Rewind};
use super::headers::{
    bad_gateway, connection_has_token, new_response, strip_hop_by_hop, wants_close,
    WarningHeadersExt,
};
use super::http1::{self, EncodedResponse};
use super::response_ext::{IntoProxyBody, ProxyBody};
use super::server::{Proxy, Settings};
use super::session::{Context, Hijacked, Session};
use super::shaping;
use crate::error::ProxyError;
use crate::metrics::{self, ActiveConnectionGuard};
use crate::mitm::Mitm;
use bytes::Bytes;
use hyper::header;
use hyper::http::request;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info_span, warn, Instrument};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// The client stream as the handler sees it.
pub(crate) type ConnIo = BufReader<Box<dyn Connection>>;

/// What the connection loop does after a cycle.
pub(crate) enum Outcome {
    /// Read the next request from the same stream.
    Continue,
    Close,
    /// Terminate TLS on the stream, then continue with the decrypted stream.
    Upgrade(Interception),
    /// The session was hijacked; hand the stream over and stop.
    Hijacked,
}

/// A CONNECT that answered `200` and saw a TLS ClientHello start.
pub(crate) struct Interception {
    pub parts: request::Parts,
    pub mitm: Arc<dyn Mitm>,
}

pub(crate) async fn serve_connection(
    proxy: Proxy,
    conn: Box<dyn Connection>,
    peer_addr: SocketAddr,
) {
    let _active = ActiveConnectionGuard::new();
    if proxy.closing() {
        debug!(%peer_addr, "Proxy closing, dropping connection");
        return;
    }

    let session = Session::new();
    let span = info_span!("connection", connection_id = %session.id(), peer_addr = %peer_addr);
    async move {
        debug!("Connection opened");
        let mut io: ConnIo = BufReader::new(conn);
        loop {
            let settings = proxy.settings();
            let deadline = Instant::now() + settings.timeout;
            match handle(&proxy, &settings, &session, &mut io, peer_addr, deadline).await {
                Ok(Outcome::Continue) => {}
                Ok(Outcome::Close) => break,
                Ok(Outcome::Hijacked) => {
                    hand_off(&session, io);
                    return;
                }
                Ok(Outcome::Upgrade(interception)) => {
                    let prefix = Bytes::copy_from_slice(io.buffer());
                    let stream = Rewind::new(io.into_inner(), prefix);
                    match connect::accept_tls(stream, interception, deadline).await {
                        Ok(tls) => {
                            session.mark_secure();
                            io = BufReader::new(tls);
                        }
                        Err(e) => {
                            debug!(error = %e, "Closing connection after failed handshake");
                            return;
                        }
                    }
                }
                Err(e) if e.is_closeable() => {
                    debug!(error = %e, "Connection closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Connection error");
                    break;
                }
            }
        }
        let _ = timeout(SHUTDOWN_GRACE, io.get_mut().shutdown()).await;
        debug!("Connection finished");
    }
    .instrument(span)
    .await
}

/// Give the raw stream to whoever called [`Session::hijack`].
fn hand_off(session: &Session, io: ConnIo) {
    match session.take_hijack_sender() {
        Some(tx) => {
            let read_buf = Bytes::copy_from_slice(io.buffer());
            if tx
                .send(Hijacked {
                    io: io.into_inner(),
                    read_buf,
                })
                .is_err()
            {
                debug!("Hijacker went away before taking the connection");
            }
        }
        None => debug!("Connection hijacked, releasing stream"),
    }
}

/// One request/response cycle.
async fn handle(
    proxy: &Proxy,
    settings: &Settings,
    session: &Arc<Session>,
    io: &mut ConnIo,
    peer_addr: SocketAddr,
    deadline: Instant,
) -> Result<Outcome, ProxyError> {
    let read = tokio::select! {
        _ = proxy.shared.lifecycle.token().cancelled() => {
            debug!("Shutdown while awaiting request");
            return Ok(Outcome::Close);
        }
        read = timeout_at(deadline, http1::read_request(io)) => read,
    };
    let req = match read {
        Err(_) => {
            debug!("Timed out awaiting request");
            return Ok(Outcome::Close);
        }
        Ok(Ok(None)) => return Ok(Outcome::Close),
        Ok(Ok(Some(req))) => req,
        Ok(Err(e)) => return Err(e),
    };

    let mut req = req.into_boxed();
    let ctx = Context::with_session(session);
    let _link = proxy
        .shared
        .registry
        .link(&mut req, Arc::clone(&ctx));

    if let Some(info) = io.get_ref().tls_info() {
        session.mark_secure();
        req.extensions_mut().insert(info);
    }
    req.extensions_mut().insert(RemoteAddr(peer_addr));

    // Host-less requests carry on; the round trip answers them with a 502.
    if let Err(e) = normalize_uri(&mut req, session.is_secure()) {
        debug!(uri = %req.uri(), error = %e, "Request target left unnormalized");
    }

    if req.method() == Method::CONNECT {
        debug!(method = %req.method(), uri = %req.uri(), "Handling CONNECT");
        return connect::handle_connect(settings, &ctx, io, req, deadline).await;
    }
    debug!(method = %req.method(), uri = %req.uri(), "Handling request");

    let mut warnings = Vec::new();
    if run_request_modifier(settings, &ctx, &mut req, &mut warnings).await {
        return Ok(Outcome::Hijacked);
    }

    let method = req.method().clone();
    let version = req.version();
    let client_close = wants_close(version, req.headers());
    let url = req.uri().to_string();

    let mut res = round_trip(settings, &ctx, req).await;
    for warning in &warnings {
        res.add_warning(warning);
    }
    if run_response_modifier(settings, &ctx, &mut res).await {
        return Ok(Outcome::Hijacked);
    }

    let close =
        client_close || connection_has_token(res.headers(), "close") || proxy.closing();
    strip_hop_by_hop(res.headers_mut());
    let encoded = http1::encode_response(&mut res, &method, version, close);

    let shaper = io.get_ref().shaper();
    if let Some(shaper) = &shaper {
        shaping::install_context(
            shaper.as_ref(),
            &url,
            shaping::range_start(&res),
            encoded.head.len(),
        );
    }

    let status = res.status();
    write_encoded(io, &encoded, res.into_body(), deadline).await?;
    metrics::record_request(method.as_str(), status.as_u16());
    if !ctx.skipping_logging() {
        debug!(method = %method, uri = %url, status = status.as_u16(), "Response written");
    }

    if shaper.is_some_and(|s| s.take_forced_close()) {
        debug!("Traffic shaper forced close");
        return Ok(Outcome::Close);
    }
    Ok(if encoded.close {
        Outcome::Close
    } else {
        Outcome::Continue
    })
}

/// Turn an origin-form or absolute-form target into an absolute URI whose
/// scheme reflects the session.
fn normalize_uri(req: &mut Request<ProxyBody>, secure: bool) -> Result<(), ProxyError> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.clone(),
        None => req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ProxyError::Parse(format!("no host for {}", req.uri())))?
            .parse::<Authority>()
            .map_err(|e| ProxyError::Parse(format!("invalid host header: {e}")))?,
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    let scheme = if secure { Scheme::HTTPS } else { Scheme::HTTP };

    *req.uri_mut() = Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Parse(e.to_string()))?;
    Ok(())
}

/// Synthesized `200` when the round trip is skipped, `502` on failure.
async fn round_trip(settings: &Settings, ctx: &Context, req: Request<ProxyBody>) -> Response<ProxyBody> {
    if ctx.skipping_round_trip() {
        debug!(uri = %req.uri(), "Round trip skipped");
        return new_response(StatusCode::OK);
    }
    let uri = req.uri().clone();
    if uri.authority().is_none() {
        metrics::ROUND_TRIP_ERRORS_TOTAL.inc();
        let err = ProxyError::Parse(format!("no host for {uri}"));
        warn!(uri = %uri, error = %err, "Round trip failed");
        return bad_gateway(&err);
    }
    match settings.round_tripper.round_trip(req).await {
        Ok(res) => res,
        Err(e) => {
            metrics::ROUND_TRIP_ERRORS_TOTAL.inc();
            warn!(uri = %uri, error = %e, "Round trip failed");
            bad_gateway(&e)
        }
    }
}

/// Run the request modifier, collecting its error as a warning.
///
/// Returns true if the session got hijacked.
pub(crate) async fn run_request_modifier(
    settings: &Settings,
    ctx: &Context,
    req: &mut Request<ProxyBody>,
    warnings: &mut Vec<String>,
) -> bool {
    if let Err(e) = settings.request_modifier.modify_request(ctx, req).await {
        metrics::record_modifier_error("request");
        warn!(method = %req.method(), uri = %req.uri(), error = %e, "Request modifier failed");
        warnings.push(e.to_string());
    }
    ctx.session().hijacked()
}

/// Run the response modifier, turning its error into a warning.
///
/// Returns true if the session got hijacked.
pub(crate) async fn run_response_modifier(
    settings: &Settings,
    ctx: &Context,
    res: &mut Response<ProxyBody>,
) -> bool {
    if let Err(e) = settings.response_modifier.modify_response(ctx, res).await {
        metrics::record_modifier_error("response");
        warn!(status = res.status().as_u16(), error = %e, "Response modifier failed");
        res.add_warning(&e.to_string());
    }
    ctx.session().hijacked()
}

/// Encode and write a response that no shaper needs to see.
pub(crate) async fn respond(
    io: &mut ConnIo,
    mut res: Response<ProxyBody>,
    method: &Method,
    version: Version,
    close: bool,
    deadline: Instant,
) -> Result<EncodedResponse, ProxyError> {
    strip_hop_by_hop(res.headers_mut());
    let encoded = http1::encode_response(&mut res, method, version, close);
    let status = res.status();
    write_encoded(io, &encoded, res.into_body(), deadline).await?;
    metrics::record_request(method.as_str(), status.as_u16());
    Ok(encoded)
}

async fn write_encoded(
    io: &mut ConnIo,
    encoded: &EncodedResponse,
    body: ProxyBody,
    deadline: Instant,
) -> Result<(), ProxyError> {
    timeout_at(deadline, http1::write_response(io, encoded, body))
        .await
        .map_err(|_| ProxyError::Timeout)??;
    Ok(())
}
