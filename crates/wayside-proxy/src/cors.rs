//! CORS decorator for HTTP services.
//!
//! [`CorsLayer`] wraps any `tower::Service` that speaks `http` types. Requests
//! without an `Origin` header are passed through untouched. Cross-origin
//! requests get `Access-Control-Allow-*` headers on the way out, and
//! preflight `OPTIONS` requests are answered directly.

use futures::future::BoxFuture;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use std::task::{Context, Poll};
use tower::{Layer, Service};

static TRUE: HeaderValue = HeaderValue::from_static("true");

/// Configuration for the CORS decorator.
#[derive(Debug, Clone)]
pub struct CorsLayer {
    allow_origin: HeaderValue,
    allow_credentials: bool,
}

impl Default for CorsLayer {
    fn default() -> Self {
        Self {
            allow_origin: HeaderValue::from_static("*"),
            allow_credentials: false,
        }
    }
}

impl CorsLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `Access-Control-Allow-Origin`. Defaults to `*`.
    pub fn allow_origin(mut self, origin: HeaderValue) -> Self {
        self.allow_origin = origin;
        self
    }

    /// Send `Access-Control-Allow-Credentials: true`.
    pub fn allow_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    fn decorate(&self, request_headers: &HeaderMap, headers: &mut HeaderMap) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        if self.allow_credentials {
            headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, TRUE.clone());
        }
        if let Some(method) = request_headers.get(header::ACCESS_CONTROL_REQUEST_METHOD) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, method.clone());
        }
        if let Some(allowed) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allowed.clone());
        }
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = Cors<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Cors {
            inner,
            config: self.clone(),
        }
    }
}

/// Service produced by [`CorsLayer`].
#[derive(Debug, Clone)]
pub struct Cors<S> {
    inner: S,
    config: CorsLayer,
}

impl<S, ReqB, ResB> Service<Request<ReqB>> for Cors<S>
where
    S: Service<Request<ReqB>, Response = Response<ResB>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqB: Send + 'static,
    ResB: Default + Send + 'static,
{
    type Response = Response<ResB>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqB>) -> Self::Future {
        if !req.headers().contains_key(header::ORIGIN) {
            return Box::pin(self.inner.call(req));
        }

        let config = self.config.clone();
        if req.method() == Method::OPTIONS {
            let mut res = Response::new(ResB::default());
            *res.status_mut() = StatusCode::OK;
            config.decorate(req.headers(), res.headers_mut());
            return Box::pin(async move { Ok(res) });
        }

        let request_headers = req.headers().clone();
        let fut = self.inner.call(req);
        Box::pin(async move {
            let mut res = fut.await?;
            config.decorate(&request_headers, res.headers_mut());
            Ok(res)
        })
    }
}
