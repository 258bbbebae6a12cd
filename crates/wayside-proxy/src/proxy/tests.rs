//! Engine tests driven over in-memory connections.
//!
//! These use a scripted [`Listener`] that hands out duplex pipes, so the accept
//! loop, the per-connection state machine and the shaping hook can be
//! exercised without sockets.

use super::connection::{Connection, Listener};
use super::http1::read_response;
use super::response_ext::{full, ProxyBody};
use super::server::Proxy;
use super::shaping::testing::{FixedBucket, RecordingShaper};
use super::shaping::{Bucket, ShapingRule, ThrottleDecision, TrafficShaper};
use super::transport::RoundTripper;
use crate::error::{BoxError, ProxyError};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::{header, Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf};

type Accepted = io::Result<(Box<dyn Connection>, SocketAddr)>;

/// Replays a fixed sequence of accept results, then blocks forever.
struct ScriptedListener {
    script: VecDeque<Accepted>,
}

impl ScriptedListener {
    fn new(script: Vec<Accepted>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

#[async_trait]
impl Listener for ScriptedListener {
    async fn accept(&mut self) -> Accepted {
        match self.script.pop_front() {
            Some(next) => next,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(peer())
    }
}

fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}

/// A duplex pipe with a traffic shaper attached.
struct ShapedPipe {
    inner: DuplexStream,
    shaper: Arc<RecordingShaper>,
}

impl AsyncRead for ShapedPipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ShapedPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connection for ShapedPipe {
    fn shaper(&self) -> Option<Arc<dyn TrafficShaper>> {
        Some(self.shaper.clone())
    }
}

/// Answers every request with a fixed status and records what it saw.
struct StubTransport {
    status: StatusCode,
    headers: Vec<(header::HeaderName, &'static str)>,
    seen: Mutex<Vec<String>>,
    proxy: Option<Proxy>,
    linked_during_round_trip: Mutex<Vec<bool>>,
}

impl StubTransport {
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            seen: Mutex::new(Vec::new()),
            proxy: None,
            linked_during_round_trip: Mutex::new(Vec::new()),
        }
    }

    fn header(mut self, name: header::HeaderName, value: &'static str) -> Self {
        self.headers.push((name, value));
        self
    }

    fn watching(mut self, proxy: &Proxy) -> Self {
        self.proxy = Some(proxy.clone());
        self
    }
}

#[async_trait]
impl RoundTripper for StubTransport {
    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, BoxError> {
        self.seen.lock().push(req.uri().to_string());
        if let Some(proxy) = &self.proxy {
            self.linked_during_round_trip
                .lock()
                .push(proxy.context_for(&req).is_some());
        }
        let mut res = Response::new(full("stub body"));
        *res.status_mut() = self.status;
        for (name, value) in &self.headers {
            res.headers_mut()
                .insert(name.clone(), header::HeaderValue::from_static(value));
        }
        Ok(res)
    }
}

async fn exchange(
    client: &mut BufReader<DuplexStream>,
    raw: &[u8],
) -> Response<http_body_util::Full<Bytes>> {
    client.get_mut().write_all(raw).await.unwrap();
    read_response(client, &Method::GET).await.unwrap()
}

#[tokio::test]
async fn test_acceptor_survives_transient_errors() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![
        Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
        Err(io::Error::from(io::ErrorKind::ConnectionReset)),
        Err(io::Error::from(io::ErrorKind::Interrupted)),
        Ok((Box::new(server), peer())),
    ]);

    let proxy = Proxy::new();
    proxy.set_round_tripper(Arc::new(StubTransport::new(StatusCode::OK)));
    let serving = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    let res = exchange(
        &mut client,
        b"GET http://origin.test/ HTTP/1.1\r\nHost: origin.test\r\n\r\n",
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.into_body().collect().await.unwrap().to_bytes(),
        "stub body"
    );

    drop(client);
    proxy.close().await;
    assert!(serving.await.unwrap().is_ok());
    assert_eq!(proxy.active_connections(), 0);
}

#[tokio::test]
async fn test_acceptor_stops_on_fatal_error() {
    let listener = ScriptedListener::new(vec![Err(io::Error::from(
        io::ErrorKind::PermissionDenied,
    ))]);
    let proxy = Proxy::new();
    let result = proxy.serve(listener).await;
    assert!(matches!(result, Err(ProxyError::Accept(_))));
}

#[tokio::test]
async fn test_serve_after_close_returns_immediately() {
    let proxy = Proxy::new();
    proxy.close().await;
    assert!(proxy.closing());
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        proxy.serve(ScriptedListener::new(Vec::new())),
    )
    .await
    .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_keep_alive_serves_several_requests() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![Ok((Box::new(server), peer()))]);

    let transport = Arc::new(StubTransport::new(StatusCode::OK));
    let proxy = Proxy::new();
    proxy.set_round_tripper(transport.clone());
    let serving = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    for path in ["/one", "/two"] {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: origin.test\r\n\r\n");
        let res = exchange(&mut client, raw.as_bytes()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.headers().get(header::CONNECTION).is_none());
    }

    // Connection: close on the last request ends the connection after it.
    let res = exchange(
        &mut client,
        b"GET /three HTTP/1.1\r\nHost: origin.test\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(res.headers()[header::CONNECTION], "close");
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    assert_eq!(
        *transport.seen.lock(),
        vec![
            "http://origin.test/one",
            "http://origin.test/two",
            "http://origin.test/three"
        ]
    );

    proxy.close().await;
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_origin_close_closes_client_connection() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![Ok((Box::new(server), peer()))]);

    let transport = Arc::new(StubTransport::new(StatusCode::OK).header(header::CONNECTION, "close"));
    let proxy = Proxy::new();
    proxy.set_round_tripper(transport);
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    let res = exchange(&mut client, b"GET /x HTTP/1.1\r\nHost: origin.test\r\n\r\n").await;
    assert_eq!(res.headers()[header::CONNECTION], "close");
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    proxy.close().await;
}

#[tokio::test]
async fn test_context_linked_only_during_cycle() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![Ok((Box::new(server), peer()))]);

    let proxy = Proxy::new();
    let transport = Arc::new(StubTransport::new(StatusCode::OK).watching(&proxy));
    proxy.set_round_tripper(transport.clone());
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    exchange(&mut client, b"GET /a HTTP/1.1\r\nHost: origin.test\r\n\r\n").await;
    exchange(&mut client, b"GET /b HTTP/1.1\r\nHost: origin.test\r\n\r\n").await;

    assert_eq!(*transport.linked_during_round_trip.lock(), vec![true, true]);
    assert!(proxy.shared.registry.is_empty());

    drop(client);
    proxy.close().await;
}

#[tokio::test]
async fn test_http10_request_closes_by_default() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![Ok((Box::new(server), peer()))]);

    let proxy = Proxy::new();
    proxy.set_round_tripper(Arc::new(StubTransport::new(StatusCode::OK)));
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    let res = exchange(&mut client, b"GET /old HTTP/1.0\r\nHost: origin.test\r\n\r\n").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONNECTION], "close");

    proxy.close().await;
}

#[tokio::test]
async fn test_malformed_request_drops_connection_without_response() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![Ok((Box::new(server), peer()))]);

    let proxy = Proxy::new();
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = client;
    client.write_all(b"NOT HTTP AT ALL\r\n\r\n").await.unwrap();
    let mut out = Vec::new();
    client.read_to_end(&mut out).await.unwrap();
    assert!(out.is_empty());

    proxy.close().await;
}

#[tokio::test]
async fn test_request_timeout_closes_idle_connection() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![Ok((Box::new(server), peer()))]);

    let proxy = Proxy::new();
    proxy.set_timeout(Duration::from_millis(50));
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = client;
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    assert!(out.is_empty());

    proxy.close().await;
}

fn shaped_listener(shaper: Arc<RecordingShaper>) -> (DuplexStream, ScriptedListener) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let pipe = ShapedPipe {
        inner: server,
        shaper,
    };
    let listener = ScriptedListener::new(vec![Ok((Box::new(pipe), peer()))]);
    (client, listener)
}

fn video_rule(bucket: Arc<FixedBucket>) -> ShapingRule {
    ShapingRule {
        pattern: Regex::new(r"^http://cdn\.test/video/").unwrap(),
        bucket,
    }
}

#[tokio::test]
async fn test_shaping_context_installed_for_partial_content() {
    let bucket = FixedBucket::new(1_000_000);
    let shaper = RecordingShaper::new(
        vec![video_rule(bucket.clone())],
        ThrottleDecision {
            active: true,
            bandwidth: 64_000,
        },
    );
    let (client, listener) = shaped_listener(shaper.clone());

    let transport = Arc::new(
        StubTransport::new(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, "bytes 100-199/1000"),
    );
    let proxy = Proxy::new();
    proxy.set_round_tripper(transport);
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    let res = exchange(
        &mut client,
        b"GET /video/a.mp4 HTTP/1.1\r\nHost: cdn.test\r\nRange: bytes=100-199\r\n\r\n",
    )
    .await;
    assert_eq!(res.status(), StatusCode::PARTIAL_CONTENT);

    let installed = shaper.installed.lock();
    assert_eq!(installed.len(), 1);
    let ctx = &installed[0];
    assert!(ctx.shaping);
    assert_eq!(ctx.range_start, 100);
    assert_eq!(ctx.byte_offset, 100);
    assert!(ctx.header_len > 0);
    assert_eq!(ctx.next_action.map(|a| a.byte_offset), Some(100 + 1024));
    assert_eq!(bucket.capacity(), 64_000);
    drop(installed);

    drop(client);
    proxy.close().await;
}

#[tokio::test]
async fn test_shaper_forced_close_ends_connection() {
    let shaper = RecordingShaper::new(
        vec![video_rule(FixedBucket::new(1_000))],
        ThrottleDecision::default(),
    );
    shaper.forced_close.store(true, Ordering::SeqCst);
    let (client, listener) = shaped_listener(shaper.clone());

    let proxy = Proxy::new();
    proxy.set_round_tripper(Arc::new(StubTransport::new(StatusCode::OK)));
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    let res = exchange(
        &mut client,
        b"GET /video/b.mp4 HTTP/1.1\r\nHost: cdn.test\r\n\r\n",
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);
    // Keep-alive was negotiated, but the shaper asked for the connection to go.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(shaper.installed.lock().len(), 1);

    proxy.close().await;
}

#[tokio::test]
async fn test_unmatched_url_is_not_shaped() {
    let shaper = RecordingShaper::new(
        vec![video_rule(FixedBucket::new(1_000))],
        ThrottleDecision::default(),
    );
    let (client, listener) = shaped_listener(shaper.clone());

    let proxy = Proxy::new();
    proxy.set_round_tripper(Arc::new(StubTransport::new(StatusCode::OK)));
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    exchange(&mut client, b"GET /index.html HTTP/1.1\r\nHost: cdn.test\r\n\r\n").await;
    assert!(shaper.installed.lock().is_empty());

    drop(client);
    proxy.close().await;
}

#[tokio::test]
async fn test_unmatched_response_clears_shaping_on_keep_alive() {
    let shaper = RecordingShaper::new(
        vec![video_rule(FixedBucket::new(1_000))],
        ThrottleDecision::default(),
    );
    let (client, listener) = shaped_listener(shaper.clone());

    let proxy = Proxy::new();
    proxy.set_round_tripper(Arc::new(StubTransport::new(StatusCode::OK)));
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    exchange(&mut client, b"GET /video/a.mp4 HTTP/1.1\r\nHost: cdn.test\r\n\r\n").await;
    assert!(shaper.current.lock().as_ref().is_some_and(|ctx| ctx.shaping));

    exchange(&mut client, b"GET /index.html HTTP/1.1\r\nHost: cdn.test\r\n\r\n").await;
    assert!(shaper.current.lock().is_none());
    assert_eq!(shaper.installed.lock().len(), 1);

    drop(client);
    proxy.close().await;
}

#[tokio::test]
async fn test_error_status_is_shaped_from_zero() {
    let shaper = RecordingShaper::new(
        vec![video_rule(FixedBucket::new(1_000))],
        ThrottleDecision::default(),
    );
    let (client, listener) = shaped_listener(shaper.clone());

    let proxy = Proxy::new();
    proxy.set_round_tripper(Arc::new(StubTransport::new(StatusCode::NOT_FOUND)));
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    let res = exchange(&mut client, b"GET /video/gone.mp4 HTTP/1.1\r\nHost: cdn.test\r\n\r\n").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let current = shaper.current.lock();
    let ctx = current.as_ref().unwrap();
    assert_eq!(ctx.range_start, 0);
    assert_eq!(ctx.byte_offset, 0);
    drop(current);

    drop(client);
    proxy.close().await;
}

#[tokio::test]
async fn test_oversized_body_drops_only_that_connection() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (second_client, second_server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![
        Ok((Box::new(server), peer())),
        Ok((Box::new(second_server), peer())),
    ]);

    let transport = Arc::new(StubTransport::new(StatusCode::OK));
    let proxy = Proxy::new();
    proxy.set_round_tripper(transport.clone());
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = client;
    client
        .write_all(
            b"POST http://origin.test/ HTTP/1.1\r\nHost: origin.test\r\n\
              Content-Length: 1000000000000000\r\n\r\n",
        )
        .await
        .unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    assert!(transport.seen.lock().is_empty());

    // The proxy itself keeps serving.
    let mut second = BufReader::new(second_client);
    let res = exchange(
        &mut second,
        b"GET http://origin.test/ok HTTP/1.1\r\nHost: origin.test\r\n\r\n",
    )
    .await;
    assert_eq!(res.status(), StatusCode::OK);

    drop(second);
    proxy.close().await;
}

#[tokio::test]
async fn test_request_without_host_gets_bad_gateway() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let listener = ScriptedListener::new(vec![Ok((Box::new(server), peer()))]);

    let transport = Arc::new(StubTransport::new(StatusCode::OK));
    let proxy = Proxy::new();
    proxy.set_round_tripper(transport.clone());
    tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    let mut client = BufReader::new(client);
    let res = exchange(&mut client, b"GET / HTTP/1.0\r\n\r\n").await;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let warning = res.headers()[header::WARNING].to_str().unwrap().to_string();
    assert!(warning.contains("no host"), "{warning}");
    assert!(transport.seen.lock().is_empty());

    // HTTP/1.0 without keep-alive closes after the answer.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    proxy.close().await;
}

#[tokio::test]
async fn test_connection_future_is_send() {
    fn assert_send<T: Send>(_: &T) {}

    let (_client, server) = tokio::io::duplex(16);
    let fut = super::handler::serve_connection(Proxy::new(), Box::new(server), peer());
    assert_send(&fut);
}
