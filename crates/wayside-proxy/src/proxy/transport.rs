//! Upstream transport: how requests leave the proxy.
//!
//! The default [`HttpTransport`] is a pooled hyper-util client over rustls.
//! Every outbound socket is opened through a [`Dialer`], and when a
//! downstream proxy is configured plain requests are sent to it in absolute
//! form while HTTPS requests are tunnelled through it with CONNECT.

use super::connection::{Connection, Rewind};
use super::headers::strip_hop_by_hop;
use super::http1;
use super::response_ext::ProxyBody;
use super::tls::NoVerifier;
use crate::error::{BoxError, ProxyError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::http::uri::Scheme;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection as ClientConnection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Sends a request upstream and returns the response.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, BoxError>;
}

/// Opens outbound byte streams to `host:port` addresses.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>>;
}

/// Plain TCP dialer with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<Box<dyn Connection>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// `host:port` for a URI, defaulting the port from the scheme.
pub fn target_addr(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    let default_port = if uri.scheme() == Some(&Scheme::HTTPS) {
        443
    } else {
        80
    };
    Some(format!("{host}:{}", uri.port_u16().unwrap_or(default_port)))
}

/// Address of a downstream proxy given as `http://host:port`.
pub fn proxy_addr(proxy: &Uri) -> Result<String, ProxyError> {
    match proxy.scheme_str() {
        Some("http") | None => {}
        Some(other) => {
            return Err(ProxyError::Config(format!(
                "unsupported downstream proxy scheme {other:?}"
            )))
        }
    }
    let host = proxy
        .host()
        .ok_or_else(|| ProxyError::Config(format!("downstream proxy {proxy} has no host")))?;
    Ok(format!("{host}:{}", proxy.port_u16().unwrap_or(80)))
}

/// Open a CONNECT tunnel to `target` over an established proxy connection.
///
/// Bytes the proxy sent after its response head are kept in front of the
/// returned stream.
pub async fn connect_tunnel(
    io: Box<dyn Connection>,
    target: &str,
) -> Result<Box<dyn Connection>, ProxyError> {
    let req = Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .body(())
        .map_err(|e| ProxyError::Parse(e.to_string()))?;

    let mut reader = BufReader::new(io);
    reader
        .get_mut()
        .write_all(&http1::encode_request_head(&req))
        .await?;
    reader.get_mut().flush().await?;

    let res = http1::read_response(&mut reader, &Method::CONNECT).await?;
    if !res.status().is_success() {
        return Err(ProxyError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("downstream proxy answered CONNECT {target} with {}", res.status()),
        )));
    }

    let leftover = Bytes::copy_from_slice(reader.buffer());
    Ok(Box::new(Rewind::new(reader.into_inner(), leftover)))
}

/// `tower::Service<Uri>` that opens connections for the pooled client.
#[derive(Clone)]
pub struct DialConnector {
    dialer: Arc<dyn Dialer>,
    downstream_proxy: Option<Uri>,
}

impl DialConnector {
    pub fn new(dialer: Arc<dyn Dialer>, downstream_proxy: Option<Uri>) -> Self {
        Self {
            dialer,
            downstream_proxy,
        }
    }

    async fn connect(self, dst: Uri) -> Result<DialedStream, BoxError> {
        let target = target_addr(&dst).ok_or_else(|| format!("no host in {dst}"))?;
        let Some(proxy) = &self.downstream_proxy else {
            let io = self.dialer.dial(&target).await?;
            return Ok(DialedStream::new(io, false));
        };

        let addr = proxy_addr(proxy)?;
        let io = self.dialer.dial(&addr).await.map_err(|source| ProxyError::Dial {
            addr: addr.clone(),
            source,
        })?;
        if dst.scheme() == Some(&Scheme::HTTPS) {
            debug!(tunnel_target = %target, proxy = %addr, "Tunnelling through downstream proxy");
            let io = connect_tunnel(io, &target).await?;
            Ok(DialedStream::new(io, false))
        } else {
            Ok(DialedStream::new(io, true))
        }
    }
}

impl tower::Service<Uri> for DialConnector {
    type Response = DialedStream;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<DialedStream, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        Box::pin(self.clone().connect(dst))
    }
}

/// A dialed connection as seen by hyper.
pub struct DialedStream {
    io: TokioIo<Box<dyn Connection>>,
    proxied: bool,
}

impl DialedStream {
    fn new(io: Box<dyn Connection>, proxied: bool) -> Self {
        Self {
            io: TokioIo::new(io),
            proxied,
        }
    }
}

impl ClientConnection for DialedStream {
    fn connected(&self) -> Connected {
        Connected::new().proxy(self.proxied)
    }
}

impl Read for DialedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for DialedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Knobs for the default transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Accept any upstream certificate.
    pub skip_verify: bool,
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            skip_verify: false,
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

type PooledClient = Client<hyper_rustls::HttpsConnector<DialConnector>, ProxyBody>;

/// Pooled HTTP/1.1 client used when no custom round-tripper is set.
#[derive(Clone)]
pub struct HttpTransport {
    client: PooledClient,
}

impl HttpTransport {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        downstream_proxy: Option<Uri>,
        options: &TransportOptions,
    ) -> Self {
        let builder = hyper_rustls::HttpsConnectorBuilder::new();
        let builder = if options.skip_verify {
            warn!("Upstream TLS certificate verification DISABLED (development/testing only)");
            builder.with_tls_config(
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth(),
            )
        } else {
            match builder.with_native_roots() {
                Ok(builder) => builder,
                Err(e) => {
                    warn!("Failed to load native root certificates ({e}), using bundled roots");
                    hyper_rustls::HttpsConnectorBuilder::new().with_webpki_roots()
                }
            }
        };
        let connector = builder
            .https_or_http()
            .enable_http1()
            .wrap_connector(DialConnector::new(dialer, downstream_proxy.clone()));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(options.idle_timeout)
            .pool_max_idle_per_host(options.max_idle_per_host)
            .build(connector);

        info!(
            "Upstream transport configured (HTTP/1.1): max_idle={}, idle_timeout={}s, downstream_proxy={}",
            options.max_idle_per_host,
            options.idle_timeout.as_secs(),
            downstream_proxy
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string())
        );

        Self { client }
    }
}

#[async_trait]
impl RoundTripper for HttpTransport {
    async fn round_trip(
        &self,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, BoxError> {
        strip_hop_by_hop(req.headers_mut());
        let res = self.client.request(req).await?;
        Ok(res.map(|body| body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_target_addr_defaults_port_from_scheme() {
        let uri: Uri = "https://example.com/x".parse().unwrap();
        assert_eq!(target_addr(&uri).unwrap(), "example.com:443");
        let uri: Uri = "http://example.com:8080/".parse().unwrap();
        assert_eq!(target_addr(&uri).unwrap(), "example.com:8080");
        let uri: Uri = "/relative".parse().unwrap();
        assert!(target_addr(&uri).is_none());
    }

    #[test]
    fn test_proxy_addr_rejects_https_scheme() {
        let uri: Uri = "http://proxy.local:3128".parse().unwrap();
        assert_eq!(proxy_addr(&uri).unwrap(), "proxy.local:3128");
        let uri: Uri = "https://proxy.local".parse().unwrap();
        assert!(matches!(proxy_addr(&uri), Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let dialer = TcpDialer::default();
        let conn = dialer.dial(&addr.to_string()).await;
        assert!(conn.is_ok());
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_tunnel_keeps_leftover_bytes() {
        let (client, server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "CONNECT origin.test:443 HTTP/1.1\r\n");
            loop {
                line.clear();
                reader.read_line(&mut line).await.unwrap();
                if line == "\r\n" {
                    break;
                }
            }
            reader
                .get_mut()
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nearly")
                .await
                .unwrap();
            reader
        });

        let mut tunnel = connect_tunnel(Box::new(client), "origin.test:443")
            .await
            .unwrap();
        let _proxy = proxy.await.unwrap();
        let mut buf = [0u8; 5];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");
    }

    #[tokio::test]
    async fn test_connect_tunnel_refused() {
        let (client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let _ = server.read(&mut buf).await;
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let err = connect_tunnel(Box::new(client), "origin.test:443")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("407"));
    }
}
