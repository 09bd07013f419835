//! Error types shared across the runtime.
//!
//! # Design Decisions
//! - One enum per failure domain, composed into [`ServerError`] at the top
//! - Programmer errors (bad route patterns, bad config) fail fast at
//!   registration/startup; request-time errors become structured responses
//! - Resource exhaustion from the OS is recoverable, not fatal

use thiserror::Error;

/// Top-level error for server startup and request handling.
#[derive(Debug, Error)]
pub enum ServerError {
    /// I/O failure from the socket or filesystem layer.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration rejected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS material could not be loaded or the handshake setup failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// The HTTP/2 layer failed at the protocol level.
    #[error("http/2 protocol error: {0}")]
    Protocol(String),

    /// A route producer or service hook failed while generating a response.
    #[error("handler error: {0}")]
    Handler(String),

    /// No handler produced a response within the response timeout.
    #[error("response generation timed out")]
    Timeout,

    /// The server is stopping; new work is refused.
    #[error("server is stopping")]
    Stopping,
}

impl ServerError {
    /// True when the underlying cause is OS resource exhaustion that a
    /// client can reasonably retry (too many open files, busy file).
    pub fn is_resource_exhaustion(&self) -> bool {
        // EMFILE=24, ENFILE=23, EBUSY=16 on Linux.
        match self {
            ServerError::Io(e) => matches!(e.raw_os_error(), Some(16) | Some(23) | Some(24)),
            _ => false,
        }
    }

    /// True when the underlying cause is a permission failure.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ServerError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied)
    }
}

/// Error raised by [`crate::operation::Operation::throw_if_aborted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation was aborted")]
pub struct Aborted;
