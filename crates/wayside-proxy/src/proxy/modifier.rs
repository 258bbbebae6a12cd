//! Interception hooks.
//!
//! The engine always has exactly one request modifier and one response
//! modifier; [`Noop`] fills the slot when nothing is configured. Composition
//! (chains, filters) is up to the implementor.

use super::response_ext::ProxyBody;
use super::session::Context;
use crate::error::BoxError;
use async_trait::async_trait;
use hyper::{Request, Response};
use std::sync::Arc;

#[async_trait]
pub trait RequestModifier: Send + Sync {
    /// Inspect or rewrite `req` before it is sent upstream.
    ///
    /// An error is reported to the client as a `Warning` header on the
    /// eventual response and does not stop the request.
    async fn modify_request(
        &self,
        ctx: &Context,
        req: &mut Request<ProxyBody>,
    ) -> Result<(), BoxError>;
}

#[async_trait]
pub trait ResponseModifier: Send + Sync {
    async fn modify_response(
        &self,
        ctx: &Context,
        res: &mut Response<ProxyBody>,
    ) -> Result<(), BoxError>;
}

/// Leaves every message untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Noop;

#[async_trait]
impl RequestModifier for Noop {
    async fn modify_request(
        &self,
        _ctx: &Context,
        _req: &mut Request<ProxyBody>,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

#[async_trait]
impl ResponseModifier for Noop {
    async fn modify_response(
        &self,
        _ctx: &Context,
        _res: &mut Response<ProxyBody>,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

#[async_trait]
impl<M: RequestModifier + ?Sized> RequestModifier for Arc<M> {
    async fn modify_request(
        &self,
        ctx: &Context,
        req: &mut Request<ProxyBody>,
    ) -> Result<(), BoxError> {
        (**self).modify_request(ctx, req).await
    }
}

#[async_trait]
impl<M: ResponseModifier + ?Sized> ResponseModifier for Arc<M> {
    async fn modify_response(
        &self,
        ctx: &Context,
        res: &mut Response<ProxyBody>,
    ) -> Result<(), BoxError> {
        (**self).modify_response(ctx, res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::response_ext::empty;
    use crate::proxy::session::Session;

    #[tokio::test]
    async fn test_noop_leaves_request_untouched() {
        let ctx = Context::with_session(&Session::new());
        let mut req = Request::builder()
            .uri("http://example.com/a")
            .header("x-keep", "1")
            .body(empty())
            .unwrap();

        Noop.modify_request(&ctx, &mut req).await.unwrap();
        assert_eq!(req.uri(), "http://example.com/a");
        assert_eq!(req.headers().len(), 1);
    }

    #[tokio::test]
    async fn test_noop_through_arc() {
        let ctx = Context::with_session(&Session::new());
        let modifier: Arc<dyn ResponseModifier> = Arc::new(Noop);
        let mut res = Response::new(empty());
        modifier.modify_response(&ctx, &mut res).await.unwrap();
        assert_eq!(res.status(), 200);
    }
}
