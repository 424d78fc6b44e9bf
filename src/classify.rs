//! Failure classification: deciding which errors are worth another attempt.
//!
//! A [`Classifier`] maps an operation error to [`Classification::Retryable`] or
//! [`Classification::Fatal`]. Closures implement the trait directly; [`DefaultClassifier`]
//! defers to the error's own [`Transient`] implementation, which is provided here for
//! `std::io::Error` and for [`DownstreamError`], the status-code error shared by the RPC, HTTP
//! and database adapters.

use crate::error::ErrorKind;
use std::fmt;
use std::io;

/// Verdict of a classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Retryable,
    Fatal,
}

impl Classification {
    pub fn is_retryable(self) -> bool {
        matches!(self, Classification::Retryable)
    }

    /// Audit taxonomy for an operation error with this verdict.
    pub fn error_kind(self) -> ErrorKind {
        match self {
            Classification::Retryable => ErrorKind::Transient,
            Classification::Fatal => ErrorKind::Fatal,
        }
    }
}

/// Decides whether an operation error may be retried.
pub trait Classifier<E>: Send + Sync {
    fn classify(&self, error: &E) -> Classification;
}

impl<E, F> Classifier<E> for F
where
    F: Fn(&E) -> Classification + Send + Sync,
{
    fn classify(&self, error: &E) -> Classification {
        self(error)
    }
}

/// Errors that know whether they are transient.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Network, timeout and transient-server errors are retryable; everything else is fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultClassifier;

impl<E: Transient> Classifier<E> for DefaultClassifier {
    fn classify(&self, error: &E) -> Classification {
        if error.is_transient() {
            Classification::Retryable
        } else {
            Classification::Fatal
        }
    }
}

/// Classifier that retries every error. Handy for idempotent reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryAll;

impl<E> Classifier<E> for RetryAll {
    fn classify(&self, _error: &E) -> Classification {
        Classification::Retryable
    }
}

/// Classifier that never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverRetry;

impl<E> Classifier<E> for NeverRetry {
    fn classify(&self, _error: &E) -> Classification {
        Classification::Fatal
    }
}

impl Transient for io::Error {
    fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::UnexpectedEof
        )
    }
}

/// Protocol-neutral status of a failed downstream call.
///
/// The codes follow the gRPC canonical set, which HTTP statuses and database driver errors map
/// onto without loss for retry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Network blips, deadline exceeded and server-internal conditions.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            StatusCode::Unavailable
                | StatusCode::DeadlineExceeded
                | StatusCode::Internal
                | StatusCode::ResourceExhausted
                | StatusCode::Aborted
        )
    }

    /// Map an HTTP status onto the canonical set.
    pub fn from_http(status: u16) -> Self {
        match status {
            400 | 422 => StatusCode::InvalidArgument,
            401 => StatusCode::Unauthenticated,
            403 => StatusCode::PermissionDenied,
            404 => StatusCode::NotFound,
            408 | 504 => StatusCode::DeadlineExceeded,
            409 => StatusCode::AlreadyExists,
            412 => StatusCode::FailedPrecondition,
            429 => StatusCode::ResourceExhausted,
            499 => StatusCode::Cancelled,
            500 => StatusCode::Internal,
            501 => StatusCode::Unimplemented,
            502 | 503 => StatusCode::Unavailable,
            _ => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error returned by a downstream call, carrying its status and message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct DownstreamError {
    code: StatusCode,
    message: String,
}

impl DownstreamError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthenticated, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Transient for DownstreamError {
    fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}
