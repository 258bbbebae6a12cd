//! Traffic-shaping hook.
//!
//! The bucket algorithm lives outside the engine. A connection that can be
//! shaped exposes a [`TrafficShaper`] through
//! [`Connection::shaper`](super::connection::Connection::shaper); before each
//! response is written the engine either builds a [`ShapingContext`]
//! describing what is about to be sent and hands it over, or clears the one
//! left from the previous response.

use hyper::header;
use hyper::{Response, StatusCode};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// A token pool that meters bytes written to a connection.
pub trait Bucket: Send + Sync {
    /// Current capacity in bytes per second.
    fn capacity(&self) -> u64;

    fn set_capacity(&self, bytes_per_sec: u64);
}

/// Associates requests whose URL matches `pattern` with a bucket.
#[derive(Clone)]
pub struct ShapingRule {
    pub pattern: Regex,
    pub bucket: Arc<dyn Bucket>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub active: bool,
    pub bandwidth: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapingAction {
    Halt { duration: Duration },
    CloseConnection,
    ChangeBandwidth { bytes_per_sec: u64 },
}

/// The next scheduled action at or after a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextAction {
    pub byte_offset: u64,
    pub index: usize,
    pub action: ShapingAction,
}

/// Everything the shaper needs to meter one response.
#[derive(Clone)]
pub struct ShapingContext {
    pub shaping: bool,
    pub url_pattern: String,
    pub bucket: Arc<dyn Bucket>,
    pub global_bucket: Option<Arc<dyn Bucket>>,
    /// Offset of the first body byte within the full resource.
    pub range_start: u64,
    pub byte_offset: u64,
    pub header_len: usize,
    pub header_bytes_written: usize,
    pub next_action: Option<NextAction>,
    pub throttle: ThrottleDecision,
}

impl std::fmt::Debug for ShapingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapingContext")
            .field("shaping", &self.shaping)
            .field("url_pattern", &self.url_pattern)
            .field("range_start", &self.range_start)
            .field("header_len", &self.header_len)
            .field("next_action", &self.next_action)
            .field("throttle", &self.throttle)
            .finish()
    }
}

/// Consumer-side contract of the external traffic shaper.
pub trait TrafficShaper: Send + Sync {
    fn rules(&self) -> Vec<ShapingRule>;

    fn global_bucket(&self, url_pattern: &str) -> Option<Arc<dyn Bucket>>;

    fn next_action(&self, url_pattern: &str, offset: u64) -> Option<NextAction>;

    fn current_throttle(&self, url_pattern: &str, offset: u64) -> ThrottleDecision;

    /// Install the context for the response about to be written.
    fn set_context(&self, ctx: ShapingContext);

    /// Drop any installed context; the next response is written unshaped.
    fn clear_context(&self);

    /// True once if a shaped write failed and the connection must be closed.
    fn take_forced_close(&self) -> bool;
}

lazy_static! {
    static ref CONTENT_RANGE: Regex = Regex::new(r"bytes (\d+)-\d+/\d+").unwrap();
}

/// Resource offset of the first body byte, or `None` if the response
/// is not shapeable.
///
/// Anything but a `206` starts at 0. A `206` is shapeable only with a single
/// `bytes start-end/total` range.
pub fn range_start<B>(res: &Response<B>) -> Option<u64> {
    if res.status() != StatusCode::PARTIAL_CONTENT {
        return Some(0);
    }
    let headers = res.headers();
    let multipart = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("multipart/byteranges"));
    if multipart {
        return None;
    }
    let range = headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
    CONTENT_RANGE.captures(range)?.get(1)?.as_str().parse().ok()
}

/// Build and install a shaping context for a response to `url`.
///
/// Returns false when no rule matches or the response is not shapeable. The
/// shaper's context is cleared in that case, so nothing carries over from an
/// earlier response on the connection.
pub fn install_context(
    shaper: &dyn TrafficShaper,
    url: &str,
    range_start: Option<u64>,
    header_len: usize,
) -> bool {
    let rule = shaper
        .rules()
        .into_iter()
        .find(|rule| rule.pattern.is_match(url));
    let (Some(rule), Some(range_start)) = (rule, range_start) else {
        shaper.clear_context();
        return false;
    };

    let pattern = rule.pattern.as_str().to_string();
    let throttle = shaper.current_throttle(&pattern, range_start);
    if throttle.active {
        rule.bucket.set_capacity(throttle.bandwidth);
    }

    let ctx = ShapingContext {
        shaping: true,
        global_bucket: shaper.global_bucket(&pattern),
        next_action: shaper.next_action(&pattern, range_start),
        url_pattern: pattern,
        bucket: rule.bucket,
        range_start,
        byte_offset: range_start,
        header_len,
        header_bytes_written: 0,
        throttle,
    };
    tracing::debug!(
        url = %url,
        pattern = %ctx.url_pattern,
        range_start,
        throttled = throttle.active,
        "Installing shaping context"
    );
    shaper.set_context(ctx);
    true
}
