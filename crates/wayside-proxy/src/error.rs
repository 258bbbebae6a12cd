//! Error taxonomy for the proxy engine.
//!
//! Only `Accept` errors ever escape [`crate::proxy::Proxy::serve`]. Everything
//! else is contained to the connection it happened on: it either closes that
//! connection or is downgraded to a `502`/`Warning` response.

use std::io;

/// Boxed error used at the plugin seams (modifiers, round-trippers, MITM).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("deadline exceeded")]
    Timeout,
    #[error("malformed request: {0}")]
    Parse(String),
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("connection already hijacked")]
    AlreadyHijacked,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProxyError {
    /// Whether the error just means "this connection is done" rather than
    /// something worth surfacing.
    pub fn is_closeable(&self) -> bool {
        match self {
            ProxyError::Timeout => true,
            ProxyError::Io(e) => is_closeable_io(e),
            _ => false,
        }
    }
}

/// EOF, resets and timeouts end a connection without being interesting.
pub fn is_closeable_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
    )
}

/// Accept errors that the acceptor retries with backoff instead of giving up.
pub fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_closeable() {
        assert!(ProxyError::Timeout.is_closeable());
    }

    #[test]
    fn test_eof_is_closeable() {
        let err = ProxyError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(err.is_closeable());
    }

    #[test]
    fn test_parse_error_not_closeable() {
        assert!(!ProxyError::Parse("bad request line".into()).is_closeable());
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
