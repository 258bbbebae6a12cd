//! Connection and listener abstractions.
//!
//! The engine never talks to `TcpStream` directly. Everything it reads from or
//! writes to is a [`Connection`], which lets TLS streams produced by
//! interception, test pipes, and traffic-shaped sockets flow through the same
//! per-connection state machine.

use super::shaping::TrafficShaper;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

/// A bidirectional byte stream the proxy can serve requests over.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Enable TCP keep-alive probes. Streams that are not sockets ignore this.
    fn set_keepalive(&self, _period: Duration) -> io::Result<()> {
        Ok(())
    }

    /// TLS state if this stream was terminated by the proxy.
    fn tls_info(&self) -> Option<TlsInfo> {
        None
    }

    /// The traffic shaper governing writes on this stream, if any.
    fn shaper(&self) -> Option<Arc<dyn TrafficShaper>> {
        None
    }
}

impl Connection for Box<dyn Connection> {
    fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        (**self).set_keepalive(period)
    }

    fn tls_info(&self) -> Option<TlsInfo> {
        (**self).tls_info()
    }

    fn shaper(&self) -> Option<Arc<dyn TrafficShaper>> {
        (**self).shaper()
    }
}

impl Connection for TcpStream {
    fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        let keepalive = socket2::TcpKeepalive::new().with_time(period);
        socket2::SockRef::from(self).set_tcp_keepalive(&keepalive)
    }
}

impl Connection for DuplexStream {}

impl<T: Connection> Connection for tokio_rustls::server::TlsStream<T> {
    fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        self.get_ref().0.set_keepalive(period)
    }

    fn shaper(&self) -> Option<Arc<dyn TrafficShaper>> {
        self.get_ref().0.shaper()
    }

    fn tls_info(&self) -> Option<TlsInfo> {
        let (_, server) = self.get_ref();
        Some(TlsInfo {
            server_name: server.server_name().map(str::to_string),
            protocol_version: server.protocol_version().map(|v| format!("{v:?}")),
            cipher_suite: server
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            alpn_protocol: server.alpn_protocol().map(<[u8]>::to_vec),
        })
    }
}

/// Negotiated TLS parameters, attached to requests read over an intercepted
/// stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsInfo {
    pub server_name: Option<String>,
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
}

/// Client address, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub SocketAddr);

/// Source of incoming connections for [`crate::proxy::Proxy::serve`].
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> io::Result<(Box<dyn Connection>, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<(Box<dyn Connection>, SocketAddr)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        Ok((Box::new(stream), addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A stream with bytes that were already read off the wire pushed back in
/// front of it.
///
/// Used when a buffered reader has to give up its underlying stream (TLS
/// handshake, hijack, downstream CONNECT) without losing what it buffered.
pub struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(inner: T, prefix: Bytes) -> Self {
        let prefix = if prefix.is_empty() { None } else { Some(prefix) };
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> (T, Bytes) {
        (self.inner, self.prefix.unwrap_or_default())
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(mut prefix) = this.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if !prefix.is_empty() {
                this.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<T: Connection> Connection for Rewind<T> {
    fn set_keepalive(&self, period: Duration) -> io::Result<()> {
        self.inner.set_keepalive(period)
    }

    fn tls_info(&self) -> Option<TlsInfo> {
        self.inner.tls_info()
    }

    fn shaper(&self) -> Option<Arc<dyn TrafficShaper>> {
        self.inner.shaper()
    }
}
