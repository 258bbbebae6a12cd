//! CONNECT handling: opaque tunnels and TLS interception.

use super::connection::{Connection, Rewind};
use super::handler::{self, ConnIo, Interception, Outcome};
use super::headers::{bad_gateway, new_response, WarningHeadersExt};
use super::http1;
use super::response_ext::{IntoProxyBody, ProxyBody};
use super::server::Settings;
use super::session::Context;
use super::transport;
use crate::error::ProxyError;
use crate::metrics;
use crate::mitm::Mitm;
use bytes::Bytes;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{timeout_at, Instant};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// First byte of a TLS record carrying a handshake message.
const TLS_HANDSHAKE: u8 = 0x16;

/// State shared by the steps of one CONNECT cycle.
struct ConnectCycle<'a> {
    settings: &'a Settings,
    ctx: &'a Arc<Context>,
    io: &'a mut ConnIo,
    version: Version,
    deadline: Instant,
    warnings: Vec<String>,
}

pub(crate) async fn handle_connect(
    settings: &Settings,
    ctx: &Arc<Context>,
    io: &mut ConnIo,
    mut req: Request<ProxyBody>,
    deadline: Instant,
) -> Result<Outcome, ProxyError> {
    let mut warnings = Vec::new();
    if handler::run_request_modifier(settings, ctx, &mut req, &mut warnings).await {
        return Ok(Outcome::Hijacked);
    }

    let mut cycle = ConnectCycle {
        settings,
        ctx,
        io,
        version: req.version(),
        deadline,
        warnings,
    };
    let target = match connect_target(req.uri()) {
        Ok(target) => target,
        Err(e) => return cycle.fail(e).await,
    };

    match settings.mitm.clone() {
        Some(mitm) => cycle.intercept(req, mitm).await,
        None => match settings.downstream_proxy.clone() {
            Some(proxy) => cycle.tunnel_via_proxy(&req, &proxy, &target).await,
            None => cycle.tunnel_direct(&target).await,
        },
    }
}

/// `host:port` of a CONNECT target, port 443 unless given.
fn connect_target(uri: &Uri) -> Result<String, ProxyError> {
    let authority = uri
        .authority()
        .ok_or_else(|| ProxyError::Parse(format!("CONNECT target {uri} has no authority")))?;
    Ok(format!(
        "{}:{}",
        authority.host(),
        authority.port_u16().unwrap_or(443)
    ))
}

impl ConnectCycle<'_> {
    async fn tunnel_direct(&mut self, target: &str) -> Result<Outcome, ProxyError> {
        let upstream = match self.dial(target).await {
            Ok(upstream) => upstream,
            Err(e) => return self.fail(e).await,
        };

        let res = self.with_warnings(new_response(StatusCode::OK));
        let Some(established) = self.answer(res).await? else {
            return Ok(Outcome::Hijacked);
        };
        if !established {
            return Ok(Outcome::Close);
        }

        metrics::record_tunnel("direct");
        info!(tunnel_target = %target, "Tunnel established");
        relay(self.io, upstream).await;
        Ok(Outcome::Close)
    }

    async fn tunnel_via_proxy(
        &mut self,
        req: &Request<ProxyBody>,
        proxy: &Uri,
        target: &str,
    ) -> Result<Outcome, ProxyError> {
        let (upstream, res) = match self.open_via_proxy(req, proxy).await {
            Ok(opened) => opened,
            Err(e) => return self.fail(e).await,
        };

        let res = self.with_warnings(res.into_boxed());
        let Some(established) = self.answer(res).await? else {
            return Ok(Outcome::Hijacked);
        };
        if !established {
            debug!(tunnel_target = %target, %proxy, "Downstream proxy refused CONNECT");
            return Ok(Outcome::Close);
        }

        metrics::record_tunnel("downstream");
        info!(tunnel_target = %target, %proxy, "Tunnel established through downstream proxy");
        let leftover = Bytes::copy_from_slice(upstream.buffer());
        relay(self.io, Rewind::new(upstream.into_inner(), leftover)).await;
        Ok(Outcome::Close)
    }

    /// Dial the downstream proxy, forward the CONNECT head and read its answer.
    async fn open_via_proxy(
        &mut self,
        req: &Request<ProxyBody>,
        proxy: &Uri,
    ) -> Result<(BufReader<Box<dyn Connection>>, Response<http_body_util::Full<Bytes>>), ProxyError>
    {
        let addr = transport::proxy_addr(proxy)?;
        let mut upstream = BufReader::new(self.dial(&addr).await?);
        upstream
            .get_mut()
            .write_all(&http1::encode_request_head(req))
            .await?;
        upstream.get_mut().flush().await?;
        let res = timeout_at(
            self.deadline,
            http1::read_response(&mut upstream, &Method::CONNECT),
        )
        .await
        .map_err(|_| ProxyError::Timeout)??;
        Ok((upstream, res))
    }

    async fn intercept(
        &mut self,
        req: Request<ProxyBody>,
        mitm: Arc<dyn Mitm>,
    ) -> Result<Outcome, ProxyError> {
        let res = self.with_warnings(new_response(StatusCode::OK));
        let Some(established) = self.answer(res).await? else {
            return Ok(Outcome::Hijacked);
        };
        if !established {
            return Ok(Outcome::Close);
        }
        metrics::record_tunnel("mitm");

        let first = match timeout_at(self.deadline, self.io.fill_buf()).await {
            Err(_) => {
                debug!(uri = %req.uri(), "Timed out waiting for intercepted traffic");
                return Ok(Outcome::Close);
            }
            Ok(read) => read?.first().copied(),
        };
        match first {
            None => Ok(Outcome::Close),
            Some(TLS_HANDSHAKE) => {
                let (parts, _) = req.into_parts();
                Ok(Outcome::Upgrade(Interception { parts, mitm }))
            }
            Some(_) => {
                debug!(uri = %req.uri(), "Intercepted tunnel carries plaintext HTTP");
                metrics::record_mitm_handshake("plaintext");
                Ok(Outcome::Continue)
            }
        }
    }

    async fn dial(&mut self, addr: &str) -> Result<Box<dyn Connection>, ProxyError> {
        let dialed = timeout_at(self.deadline, self.settings.dialer.dial(addr))
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {addr} timed out"),
                ))
            });
        dialed.map_err(|source| ProxyError::Dial {
            addr: addr.to_string(),
            source,
        })
    }

    fn with_warnings(&self, mut res: Response<ProxyBody>) -> Response<ProxyBody> {
        for warning in &self.warnings {
            res.add_warning(warning);
        }
        res
    }

    /// Run response modifiers and write the CONNECT answer.
    ///
    /// Returns `None` on hijack, otherwise whether the tunnel is up.
    async fn answer(&mut self, mut res: Response<ProxyBody>) -> Result<Option<bool>, ProxyError> {
        if handler::run_response_modifier(self.settings, self.ctx, &mut res).await {
            return Ok(None);
        }
        let established = res.status().is_success();
        handler::respond(
            self.io,
            res,
            &Method::CONNECT,
            self.version,
            !established,
            self.deadline,
        )
        .await?;
        Ok(Some(established))
    }

    /// Answer a CONNECT that could not be set up with a `502`.
    async fn fail(&mut self, err: ProxyError) -> Result<Outcome, ProxyError> {
        metrics::ROUND_TRIP_ERRORS_TOTAL.inc();
        warn!(error = %err, "CONNECT failed");
        let res = self.with_warnings(bad_gateway(&err));
        match self.answer(res).await? {
            None => Ok(Outcome::Hijacked),
            Some(_) => Ok(Outcome::Close),
        }
    }
}

/// Terminate TLS on an intercepted tunnel.
///
/// `stream` carries the peeked ClientHello bytes in front. Failures are
/// reported to the [`Mitm`] before the stream is dropped.
pub(crate) async fn accept_tls(
    stream: Rewind<Box<dyn Connection>>,
    interception: Interception,
    deadline: Instant,
) -> Result<Box<dyn Connection>, ProxyError> {
    let Interception { parts, mitm } = interception;
    let host = parts.uri.host().unwrap_or_default().to_string();

    let config = match mitm.server_config(&host) {
        Ok(config) => config,
        Err(e) => {
            let message = e.to_string();
            mitm.handshake_error(&parts, &io::Error::other(e));
            metrics::record_mitm_handshake("error");
            return Err(ProxyError::Certificate(message));
        }
    };
    let config = if config.alpn_protocols.is_empty() {
        config
    } else {
        let mut config = (*config).clone();
        config.alpn_protocols.clear();
        Arc::new(config)
    };

    let accepted = timeout_at(deadline, TlsAcceptor::from(config).accept(stream))
        .await
        .unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            ))
        });
    match accepted {
        Ok(tls) => {
            metrics::record_mitm_handshake("ok");
            debug!(host = %host, "MITM handshake complete");
            Ok(Box::new(tls))
        }
        Err(e) => {
            mitm.handshake_error(&parts, &e);
            metrics::record_mitm_handshake("error");
            Err(ProxyError::Tls(e.to_string()))
        }
    }
}

/// Copy bytes both ways until each side has finished sending.
///
/// Anything the client pipelined behind its CONNECT is still in the
/// reader's buffer and goes upstream first.
async fn relay<U>(client: &mut ConnIo, upstream: U)
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

    let to_upstream = async {
        let copied = tokio::io::copy(&mut client_rd, &mut upstream_wr).await;
        let _ = upstream_wr.shutdown().await;
        copied
    };
    let to_client = async {
        let copied = tokio::io::copy(&mut upstream_rd, &mut client_wr).await;
        let _ = client_wr.shutdown().await;
        copied
    };

    match tokio::join!(to_upstream, to_client) {
        (Ok(sent), Ok(received)) => debug!(sent, received, "Tunnel closed"),
        (Err(e), _) | (_, Err(e)) => debug!(error = %e, "Tunnel closed with error"),
    }
}
