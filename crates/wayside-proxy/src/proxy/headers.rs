//! Header helpers for the proxy engine.
//!
//! Covers the `Warning` convention used to surface internal failures to
//! clients, hop-by-hop stripping and the close decision.

use super::response_ext::{empty, ProxyBody};
use chrono::Utc;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::response::Parts;
use hyper::{Response, StatusCode, Version};

/// Agent token written into every `Warning` header the engine emits.
pub const WARN_AGENT: &str = "wayside";

static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Headers that describe a single hop and never travel past the proxy.
pub static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

/// `Date` header format (IMF-fixdate).
const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Extension trait for attaching engine headers to responses.
pub trait WarningHeadersExt {
    fn headers_mut_ref(&mut self) -> &mut HeaderMap;

    /// Append a `Warning: 199 wayside "<msg>" "<date>"` header.
    ///
    /// The date is the message's own `Date` header when it has one, else now.
    fn add_warning(&mut self, message: &str) {
        let headers = self.headers_mut_ref();
        let date = headers
            .get(header::DATE)
            .and_then(|v| v.to_str().ok())
            .map(sanitize_warn_text)
            .unwrap_or_else(|| Utc::now().format(HTTP_DATE).to_string());
        let value = format!(
            "199 {WARN_AGENT} \"{}\" \"{date}\"",
            sanitize_warn_text(message)
        );
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(header::WARNING, value);
        }
    }
}

impl<B> WarningHeadersExt for Response<B> {
    fn headers_mut_ref(&mut self) -> &mut HeaderMap {
        self.headers_mut()
    }
}

impl WarningHeadersExt for Parts {
    fn headers_mut_ref(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }
}

/// Quote-safe, single-line form of an error message.
fn sanitize_warn_text(message: &str) -> String {
    message
        .chars()
        .map(|c| match c {
            '"' => '\'',
            '\\' => '/',
            c if c.is_control() => ' ',
            c if !c.is_ascii() => '?',
            c => c,
        })
        .collect()
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Whether a comma-separated `Connection` header contains `token`.
pub fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    [&header::CONNECTION, &PROXY_CONNECTION]
        .into_iter()
        .flat_map(|name| headers.get_all(name).iter())
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether the peer that sent these headers expects the connection to close.
pub fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    if connection_has_token(headers, "close") {
        return true;
    }
    version <= Version::HTTP_10 && !connection_has_token(headers, "keep-alive")
}

/// An empty-bodied response with `status`.
pub fn new_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

/// A `502 Bad Gateway` carrying `err` as a warning.
pub fn bad_gateway(err: &dyn std::fmt::Display) -> Response<ProxyBody> {
    let mut response = new_response(StatusCode::BAD_GATEWAY);
    response.add_warning(&err.to_string());
    response
}
