//! Session and context model.
//!
//! A [`Session`] lives as long as one client connection. A [`Context`] lives
//! for one request/response cycle on that connection and is the scratch space
//! modifiers use to talk to each other. Requests find their context through
//! the [`ContextRegistry`], keyed by a [`RequestId`] stored in the request's
//! extensions.

use super::connection::Connection;
use crate::error::ProxyError;
use bytes::Bytes;
use hyper::Request;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;
use tokio::sync::oneshot;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Identifier stamped on a request when it is linked to a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        Self(REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// The raw connection handed to a modifier that hijacked its session.
pub struct Hijacked {
    pub io: Box<dyn Connection>,
    /// Bytes the engine had already read from `io` but not consumed.
    pub read_buf: Bytes,
}

/// Resolves to the raw connection once the engine lets go of it.
pub struct HijackedConnection {
    rx: oneshot::Receiver<Hijacked>,
}

impl Future for HijackedConnection {
    type Output = Result<Hijacked, ProxyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.map_err(|_| {
                ProxyError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connection closed before it was handed off",
                ))
            })
        })
    }
}

type Value = Arc<dyn Any + Send + Sync>;

/// String-keyed values of arbitrary type.
#[derive(Default)]
struct Values(RwLock<HashMap<String, Value>>);

impl Values {
    fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.0
            .read()
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    fn set<T: Any + Send + Sync>(&self, key: String, value: T) {
        self.0.write().insert(key, Arc::new(value));
    }

    fn remove(&self, key: &str) -> bool {
        self.0.write().remove(key).is_some()
    }

    fn keys(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }
}

/// State for one client connection, shared by every cycle on it.
pub struct Session {
    id: SessionId,
    secure: AtomicBool,
    hijacked: AtomicBool,
    hijack_tx: Mutex<Option<oneshot::Sender<Hijacked>>>,
    values: Values,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SessionId(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)),
            secure: AtomicBool::new(false),
            hijacked: AtomicBool::new(false),
            hijack_tx: Mutex::new(None),
            values: Values::default(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Record that the connection carries TLS.
    ///
    /// Requests read off a TLS stream mark the session again, so
    /// [`Session::mark_insecure`] only lasts until the next such request.
    pub fn mark_secure(&self) {
        self.secure.store(true, Ordering::SeqCst);
    }

    pub fn mark_insecure(&self) {
        self.secure.store(false, Ordering::SeqCst);
    }

    pub fn is_secure(&self) -> bool {
        self.secure.load(Ordering::SeqCst)
    }

    /// Record that something outside the engine owns the connection now.
    ///
    /// The engine stops at the next checkpoint and drops the stream without
    /// writing to it. Use [`Session::hijack`] to receive the stream instead.
    pub fn mark_hijacked(&self) {
        self.hijacked.store(true, Ordering::SeqCst);
    }

    pub fn hijacked(&self) -> bool {
        self.hijacked.load(Ordering::SeqCst)
    }

    /// Take ownership of the raw connection.
    ///
    /// Only the first call on a session succeeds. The returned future
    /// resolves after the current modifier returns and the engine reaches
    /// its hijack checkpoint.
    pub fn hijack(&self) -> Result<HijackedConnection, ProxyError> {
        let mut slot = self.hijack_tx.lock();
        if self.hijacked.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyHijacked);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(HijackedConnection { rx })
    }

    pub(crate) fn take_hijack_sender(&self) -> Option<oneshot::Sender<Hijacked>> {
        self.hijack_tx.lock().take()
    }

    /// Typed lookup of a value kept for the whole connection.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key)
    }

    /// Keep `value` for every later request on this connection.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.set(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.values.remove(key)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("secure", &self.is_secure())
            .field("hijacked", &self.hijacked())
            .field("keys", &self.values.keys())
            .finish()
    }
}

/// Per-request state handed to every modifier.
pub struct Context {
    id: ContextId,
    session: Arc<Session>,
    skip_round_trip: AtomicBool,
    skip_logging: AtomicBool,
    api_request: AtomicBool,
    values: Values,
}

impl Context {
    /// Create a fresh context bound to `session`. The caller links it.
    pub fn with_session(session: &Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            id: ContextId(CONTEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)),
            session: Arc::clone(session),
            skip_round_trip: AtomicBool::new(false),
            skip_logging: AtomicBool::new(false),
            api_request: AtomicBool::new(false),
            values: Values::default(),
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Typed lookup. Returns `None` if the key is missing or holds another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.values.get(key)
    }

    /// Keep `value` until this request's response has been written.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.set(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.values.remove(key)
    }

    /// Answer this request with an empty `200` instead of contacting the
    /// origin. Cannot be undone.
    pub fn skip_round_trip(&self) {
        self.skip_round_trip.store(true, Ordering::SeqCst);
    }

    pub fn skipping_round_trip(&self) -> bool {
        self.skip_round_trip.load(Ordering::SeqCst)
    }

    /// Keep this request/response pair out of request logs.
    pub fn skip_logging(&self) {
        self.skip_logging.store(true, Ordering::SeqCst);
    }

    pub fn skipping_logging(&self) -> bool {
        self.skip_logging.load(Ordering::SeqCst)
    }

    /// Mark the request as addressed to the proxy's own API rather than
    /// an origin. Modifiers that verify or record traffic skip such requests.
    pub fn api_request(&self) {
        self.api_request.store(true, Ordering::SeqCst);
    }

    pub fn is_api_request(&self) -> bool {
        self.api_request.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("skip_round_trip", &self.skipping_round_trip())
            .field("skip_logging", &self.skipping_logging())
            .field("api_request", &self.is_api_request())
            .field("keys", &self.values.keys())
            .finish()
    }
}

/// Request-to-context association table.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: Mutex<HashMap<RequestId, Arc<Context>>>,
}

impl ContextRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Associate `req` with `ctx` until the returned guard drops.
    ///
    /// # Panics
    /// If `req` is already linked. A request is linked exactly once per cycle;
    /// a second link means a cycle is being re-entered with a stale request.
    pub fn link<B>(self: &Arc<Self>, req: &mut Request<B>, ctx: Arc<Context>) -> LinkGuard {
        let id = match req.extensions().get::<RequestId>() {
            Some(id) => *id,
            None => {
                let id = RequestId::next();
                req.extensions_mut().insert(id);
                id
            }
        };

        let already_linked = {
            let mut contexts = self.contexts.lock();
            if contexts.contains_key(&id) {
                true
            } else {
                contexts.insert(id, ctx);
                false
            }
        };
        if already_linked {
            panic!("{id} is already linked to a context");
        }

        LinkGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Remove the association for `req`, if any.
    pub fn unlink<B>(&self, req: &Request<B>) {
        if let Some(id) = req.extensions().get::<RequestId>() {
            self.contexts.lock().remove(id);
        }
    }

    pub fn get<B>(&self, req: &Request<B>) -> Option<Arc<Context>> {
        let id = req.extensions().get::<RequestId>()?;
        self.contexts.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unlinks its request when dropped.
#[must_use = "dropping the guard unlinks the request immediately"]
pub struct LinkGuard {
    registry: Arc<ContextRegistry>,
    id: RequestId,
}

impl LinkGuard {
    pub fn request_id(&self) -> RequestId {
        self.id
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.registry.contexts.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request<()> {
        Request::builder()
            .uri("http://example.com/")
            .body(())
            .unwrap()
    }

    #[test]
    fn test_mark_secure_is_idempotent() {
        let session = Session::new();
        assert!(!session.is_secure());
        session.mark_secure();
        session.mark_secure();
        assert!(session.is_secure());
    }

    #[test]
    fn test_mark_hijacked_is_idempotent() {
        let session = Session::new();
        session.mark_hijacked();
        session.mark_hijacked();
        assert!(session.hijacked());
        assert!(session.take_hijack_sender().is_none());
    }

    #[test]
    fn test_second_hijack_fails() {
        let session = Session::new();
        let _first = session.hijack().unwrap();
        assert!(matches!(
            session.hijack(),
            Err(ProxyError::AlreadyHijacked)
        ));
        assert!(session.hijacked());
    }

    #[tokio::test]
    async fn test_hijack_hand_off() {
        let session = Session::new();
        let pending = session.hijack().unwrap();

        let (client, _server) = tokio::io::duplex(16);
        let tx = session.take_hijack_sender().unwrap();
        tx.send(Hijacked {
            io: Box::new(client),
            read_buf: Bytes::from_static(b"GET"),
        })
        .ok()
        .unwrap();

        let hijacked = pending.await.unwrap();
        assert_eq!(&hijacked.read_buf[..], b"GET");
    }

    #[tokio::test]
    async fn test_hijack_dropped_sender_errors() {
        let session = Session::new();
        let pending = session.hijack().unwrap();
        drop(session.take_hijack_sender());
        assert!(pending.await.is_err());
    }

    #[test]
    fn test_context_values() {
        let session = Session::new();
        let ctx = Context::with_session(&session);

        ctx.set("count", 3u32);
        assert_eq!(ctx.get::<u32>("count").as_deref(), Some(&3));
        assert!(ctx.get::<String>("count").is_none());
        assert!(ctx.get::<u32>("missing").is_none());

        assert!(ctx.remove("count"));
        assert!(!ctx.remove("count"));
    }

    #[test]
    fn test_skip_round_trip_is_sticky() {
        let ctx = Context::with_session(&Session::new());
        assert!(!ctx.skipping_round_trip());
        ctx.skip_round_trip();
        ctx.skip_round_trip();
        assert!(ctx.skipping_round_trip());
    }

    #[test]
    fn test_mark_insecure_reverts_secure() {
        let session = Session::new();
        session.mark_secure();
        session.mark_insecure();
        assert!(!session.is_secure());
        session.mark_secure();
        assert!(session.is_secure());
    }

    #[test]
    fn test_session_values_outlive_contexts() {
        let session = Session::new();
        let first = Context::with_session(&session);
        first.session().set("user", String::from("alice"));
        first.set("scratch", 1u8);
        drop(first);

        let second = Context::with_session(&session);
        let user = second.session().get::<String>("user");
        assert_eq!(user.as_deref().map(String::as_str), Some("alice"));
        assert!(second.get::<u8>("scratch").is_none());
        assert!(session.get::<u32>("user").is_none());
        assert!(session.remove("user"));
        assert!(session.get::<String>("user").is_none());
    }

    #[test]
    fn test_logging_and_api_flags() {
        let ctx = Context::with_session(&Session::new());
        assert!(!ctx.skipping_logging());
        assert!(!ctx.is_api_request());
        ctx.skip_logging();
        ctx.api_request();
        assert!(ctx.skipping_logging());
        assert!(ctx.is_api_request());

        // Flags are per request.
        let next = Context::with_session(ctx.session());
        assert!(!next.skipping_logging());
        assert!(!next.is_api_request());
    }

    #[test]
    fn test_contexts_share_session() {
        let session = Session::new();
        let first = Context::with_session(&session);
        let second = Context::with_session(&session);
        assert_ne!(first.id(), second.id());
        assert_eq!(first.session().id(), second.session().id());
    }

    #[test]
    fn test_link_and_lookup() {
        let registry = ContextRegistry::new();
        let ctx = Context::with_session(&Session::new());
        let mut req = request();

        let guard = registry.link(&mut req, Arc::clone(&ctx));
        assert_eq!(registry.get(&req).unwrap().id(), ctx.id());
        assert_eq!(req.extensions().get::<RequestId>(), Some(&guard.request_id()));

        drop(guard);
        assert!(registry.get(&req).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unlink_is_idempotent() {
        let registry = ContextRegistry::new();
        let mut req = request();
        let _guard = registry.link(&mut req, Context::with_session(&Session::new()));

        registry.unlink(&req);
        registry.unlink(&req);
        assert!(registry.is_empty());

        // Never-linked requests are fine too.
        registry.unlink(&request());
    }

    #[test]
    fn test_relink_after_unlink() {
        let registry = ContextRegistry::new();
        let session = Session::new();
        let mut req = request();

        let guard = registry.link(&mut req, Context::with_session(&session));
        drop(guard);
        let _guard = registry.link(&mut req, Context::with_session(&session));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn test_double_link_panics() {
        let registry = ContextRegistry::new();
        let session = Session::new();
        let mut req = request();

        let _first = registry.link(&mut req, Context::with_session(&session));
        let _second = registry.link(&mut req, Context::with_session(&session));
    }
}
