//! Body type shared by every request and response the engine touches.
//!
//! Requests read off the client connection arrive as `Full<Bytes>`, origin
//! responses arrive as hyper `Incoming`, and synthesized responses are empty.
//! All of them are boxed into [`ProxyBody`] so modifiers see a single type.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use std::convert::Infallible;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Box a body that cannot fail.
pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

/// Extension trait for boxing infallible message bodies.
pub trait IntoProxyBody {
    type Boxed;

    fn into_boxed(self) -> Self::Boxed;
}

impl IntoProxyBody for Response<Full<Bytes>> {
    type Boxed = Response<ProxyBody>;

    fn into_boxed(self) -> Response<ProxyBody> {
        self.map(|b| b.map_err(|never: Infallible| match never {}).boxed())
    }
}

impl IntoProxyBody for Request<Full<Bytes>> {
    type Boxed = Request<ProxyBody>;

    fn into_boxed(self) -> Request<ProxyBody> {
        self.map(|b| b.map_err(|never: Infallible| match never {}).boxed())
    }
}
