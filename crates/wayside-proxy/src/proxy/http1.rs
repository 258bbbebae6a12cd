//! HTTP/1.x wire codec for client-facing connections.
//!
//! The engine reads requests off a buffered stream it owns itself instead of
//! handing the socket to hyper's server: between two requests it must be able
//! to sniff a TLS handshake, relay a tunnel or give the raw stream away.
//! Parsing is done with `httparse`; request bodies are buffered, response
//! bodies are streamed.

use crate::error::ProxyError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or response head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;
/// Upper bound for a buffered message body.
pub const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;
const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 1024;

static CHUNKED: HeaderValue = HeaderValue::from_static("chunked");
static CLOSE: HeaderValue = HeaderValue::from_static("close");
static KEEP_ALIVE: HeaderValue = HeaderValue::from_static("keep-alive");

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the connection closes.
    UntilClose,
}

/// Read one request.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly before
/// sending anything. Chunked bodies are de-chunked and re-labelled with a
/// `Content-Length`.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<Request<Full<Bytes>>>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(head) = read_head(reader).await? else {
        return Ok(None);
    };

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut raw_headers);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::Parse("incomplete request head".into()))
        }
        Err(e) => return Err(ProxyError::Parse(e.to_string())),
    }

    let method = parsed
        .method
        .ok_or_else(|| ProxyError::Parse("missing method".into()))
        .and_then(|m| {
            Method::from_bytes(m.as_bytes()).map_err(|e| ProxyError::Parse(e.to_string()))
        })?;
    let uri: Uri = parsed
        .path
        .ok_or_else(|| ProxyError::Parse("missing request target".into()))?
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::Parse(e.to_string()))?;
    let version = to_version(parsed.version)?;
    let mut headers = to_header_map(parsed.headers)?;

    let body = if method == Method::CONNECT {
        Bytes::new()
    } else {
        match request_framing(&headers)? {
            Framing::Chunked => {
                let body = read_chunked(reader).await?;
                headers.remove(header::TRANSFER_ENCODING);
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                body
            }
            Framing::Length(n) => read_exact(reader, n).await?,
            Framing::Empty | Framing::UntilClose => Bytes::new(),
        }
    };

    let mut request = Request::new(Full::new(body));
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version;
    *request.headers_mut() = headers;
    Ok(Some(request))
}

/// Read one response to a request made with `req_method`.
pub async fn read_response<R>(
    reader: &mut R,
    req_method: &Method,
) -> Result<Response<Full<Bytes>>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let head = read_head(reader).await?.ok_or_else(|| {
        ProxyError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response",
        ))
    })?;

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut raw_headers);
    match parsed.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ProxyError::Parse("incomplete response head".into()))
        }
        Err(e) => return Err(ProxyError::Parse(e.to_string())),
    }

    let status = parsed
        .code
        .ok_or_else(|| ProxyError::Parse("missing status code".into()))
        .and_then(|c| StatusCode::from_u16(c).map_err(|e| ProxyError::Parse(e.to_string())))?;
    let version = to_version(parsed.version)?;
    let headers = to_header_map(parsed.headers)?;

    let body = match response_framing(req_method, status, &headers)? {
        Framing::Empty => Bytes::new(),
        Framing::Length(n) => read_exact(reader, n).await?,
        Framing::Chunked => read_chunked(reader).await?,
        Framing::UntilClose => {
            let mut buf = Vec::new();
            (&mut *reader)
                .take(MAX_BODY_SIZE + 1)
                .read_to_end(&mut buf)
                .await?;
            if buf.len() as u64 > MAX_BODY_SIZE {
                return Err(body_too_large(buf.len() as u64));
            }
            Bytes::from(buf)
        }
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Serialize a request head, as sent to a downstream proxy.
///
/// CONNECT uses authority form; everything else uses the full URI.
pub fn encode_request_head<B>(req: &Request<B>) -> Vec<u8> {
    let target = if req.method() == Method::CONNECT {
        req.uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string())
    } else {
        req.uri().to_string()
    };

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(req.method().as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");
    if !req.headers().contains_key(header::HOST) {
        if let Some(authority) = req.uri().authority() {
            head.extend_from_slice(b"host: ");
            head.extend_from_slice(authority.as_str().as_bytes());
            head.extend_from_slice(b"\r\n");
        }
    }
    write_headers(&mut head, req.headers());
    head.extend_from_slice(b"\r\n");
    head
}

/// A response head ready to go on the wire, plus how its body follows.
#[derive(Debug, Clone)]
pub struct EncodedResponse {
    pub head: Vec<u8>,
    pub framing: Framing,
    /// The connection closes after this response.
    pub close: bool,
}

/// Fix up framing and connection headers on `res` and serialize its head.
///
/// Bodies with a known size get a `Content-Length`; others are chunked for
/// HTTP/1.1 clients and close-delimited for HTTP/1.0 clients, which forces
/// `close`.
pub fn encode_response<B: Body>(
    res: &mut Response<B>,
    req_method: &Method,
    req_version: Version,
    close: bool,
) -> EncodedResponse {
    let status = res.status();
    let bodyless = *req_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || (*req_method == Method::CONNECT && status.is_success());

    let body_hint = res.body().size_hint().exact();
    let headers = res.headers_mut();
    let (framing, close) = if bodyless {
        (Framing::Empty, close)
    } else if let Some(n) = body_hint {
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
        (Framing::Length(n), close)
    } else if req_version >= Version::HTTP_11 {
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(header::TRANSFER_ENCODING, CHUNKED.clone());
        (Framing::Chunked, close)
    } else {
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        (Framing::UntilClose, true)
    };

    if close {
        headers.insert(header::CONNECTION, CLOSE.clone());
    } else if req_version < Version::HTTP_11 {
        headers.insert(header::CONNECTION, KEEP_ALIVE.clone());
    }

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 ");
    head.extend_from_slice(status.as_str().as_bytes());
    head.push(b' ');
    head.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    head.extend_from_slice(b"\r\n");
    write_headers(&mut head, res.headers());
    head.extend_from_slice(b"\r\n");

    EncodedResponse {
        head,
        framing,
        close,
    }
}

/// Write an encoded head and stream `body` after it, then flush.
pub async fn write_response<W, B>(
    writer: &mut W,
    encoded: &EncodedResponse,
    body: B,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    writer.write_all(&encoded.head).await?;
    if encoded.framing != Framing::Empty {
        write_body(writer, encoded.framing, body).await?;
    }
    writer.flush().await
}

async fn write_body<W, B>(writer: &mut W, framing: Framing, mut body: B) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(io::Error::other)?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        if framing == Framing::Chunked {
            writer
                .write_all(format!("{:x}\r\n", data.len()).as_bytes())
                .await?;
            writer.write_all(&data).await?;
            writer.write_all(b"\r\n").await?;
        } else {
            writer.write_all(&data).await?;
        }
    }
    if framing == Framing::Chunked {
        writer.write_all(b"0\r\n\r\n").await?;
    }
    Ok(())
}

fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Read up to and including the blank line ending a message head.
/// Blank lines before the start line are skipped.
async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let remaining = MAX_HEAD_SIZE.saturating_sub(head.len());
        if remaining == 0 {
            return Err(ProxyError::Parse("message head too large".into()));
        }

        let start = head.len();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside message head",
            )));
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

fn to_version(minor: Option<u8>) -> Result<Version, ProxyError> {
    match minor {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        other => Err(ProxyError::Parse(format!(
            "unsupported HTTP version 1.{}",
            other.unwrap_or_default()
        ))),
    }
}

fn to_header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| ProxyError::Parse(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|e| ProxyError::Parse(e.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn is_chunked(headers: &HeaderMap) -> Option<bool> {
    let last = headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .last()?;
    Some(last.eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProxyError> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let n = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| ProxyError::Parse("invalid content-length".into()))?;
        if length.is_some_and(|prev| prev != n) {
            return Err(ProxyError::Parse("conflicting content-length".into()));
        }
        length = Some(n);
    }
    Ok(length)
}

fn request_framing(headers: &HeaderMap) -> Result<Framing, ProxyError> {
    match is_chunked(headers) {
        Some(true) => return Ok(Framing::Chunked),
        Some(false) => {
            return Err(ProxyError::Parse(
                "request transfer-encoding must end in chunked".into(),
            ))
        }
        None => {}
    }
    Ok(match content_length(headers)? {
        Some(0) | None => Framing::Empty,
        Some(n) => Framing::Length(n),
    })
}

fn response_framing(
    req_method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<Framing, ProxyError> {
    if *req_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || (*req_method == Method::CONNECT && status.is_success())
    {
        return Ok(Framing::Empty);
    }
    match is_chunked(headers) {
        Some(true) => return Ok(Framing::Chunked),
        Some(false) => return Ok(Framing::UntilClose),
        None => {}
    }
    Ok(match content_length(headers)? {
        Some(0) => Framing::Empty,
        Some(n) => Framing::Length(n),
        None => Framing::UntilClose,
    })
}

fn body_too_large(len: u64) -> ProxyError {
    ProxyError::Parse(format!(
        "body of {len} bytes exceeds the {MAX_BODY_SIZE} byte limit"
    ))
}

fn truncated_body() -> ProxyError {
    ProxyError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed inside message body",
    ))
}

/// Append exactly `n` bytes to `buf`, growing it only as data arrives.
async fn read_into<R>(reader: &mut R, n: u64, buf: &mut Vec<u8>) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader).take(n).read_to_end(buf).await?;
    if (read as u64) < n {
        return Err(truncated_body());
    }
    Ok(())
}

async fn read_exact<R>(reader: &mut R, n: u64) -> Result<Bytes, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    if n > MAX_BODY_SIZE {
        return Err(body_too_large(n));
    }
    let mut buf = Vec::new();
    read_into(reader, n, &mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn read_chunked<R>(reader: &mut R) -> Result<Bytes, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = Vec::with_capacity(32);
    loop {
        line.clear();
        read_line(reader, &mut line).await?;
        let text = std::str::from_utf8(&line)
            .map_err(|_| ProxyError::Parse("invalid chunk size line".into()))?;
        let size_str = text.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::Parse(format!("invalid chunk size {size_str:?}")))?;

        if size == 0 {
            // Trailers are read and discarded.
            loop {
                line.clear();
                read_line(reader, &mut line).await?;
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(Bytes::from(body));
                }
            }
        }

        let total = (body.len() as u64).saturating_add(size);
        if total > MAX_BODY_SIZE {
            return Err(body_too_large(total));
        }
        read_into(reader, size, &mut body).await?;
        line.clear();
        read_line(reader, &mut line).await?;
    }
}

async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>) -> Result<(), ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let n = (&mut *reader)
        .take(MAX_CHUNK_LINE as u64)
        .read_until(b'\n', line)
        .await?;
    if n == 0 || !line.ends_with(b"\n") {
        return Err(ProxyError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated chunked body",
        )));
    }
    Ok(())
}
