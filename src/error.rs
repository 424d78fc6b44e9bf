//! Error types for resilience policies.
//!
//! [`ResilienceError`] is the closed set of outcomes a policy can surface. The operation's own
//! error always travels unchanged inside [`ResilienceError::Inner`]; the remaining variants are
//! produced by the policies themselves so callers can tell them apart by matching.

use std::fmt;
use std::time::Duration;

/// Unified error type for all resilience policies
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The attempt exceeded its time budget.
    TimedOut { elapsed: Duration, timeout: Duration },
    /// The circuit for `policy` is open (or a half-open probe is already in flight); the
    /// operation was not invoked.
    CircuitOpen { policy: String, consecutive_failures: u32, retry_after: Duration },
    /// The caller cancelled the call while it was waiting.
    Cancelled,
    /// No policy with this name is registered.
    UnknownPolicy { name: String },
    /// The underlying operation failed. After retries are exhausted this is the last error seen.
    Inner(E),
}

/// Failure taxonomy used in audit records and breaker accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Expected to succeed if tried again (network blip, deadline exceeded, server-internal).
    Transient,
    /// Validation, auth, not-found and anything else not worth retrying.
    Fatal,
    /// Attempt exceeded its timeout.
    TimedOut,
    /// Rejected by the circuit breaker.
    CircuitOpen,
    /// Cancelled by the caller.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { policy, consecutive_failures, retry_after } => write!(
                f,
                "circuit breaker '{}' open ({} consecutive failures, retry after {:?})",
                policy, consecutive_failures, retry_after
            ),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::UnknownPolicy { name } => write!(f, "no resilience policy named '{}'", name),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_unknown_policy(&self) -> bool {
        matches!(self, Self::UnknownPolicy { .. })
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// `(elapsed, timeout)` for a timed-out attempt.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::TimedOut { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Remaining break time reported by an open circuit.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Kind of a policy-generated error. `Inner` errors have no intrinsic kind; their
    /// classification depends on the classifier in use, so this returns `None` for them.
    pub fn policy_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::TimedOut { .. } => Some(ErrorKind::TimedOut),
            Self::CircuitOpen { .. } => Some(ErrorKind::CircuitOpen),
            Self::Cancelled => Some(ErrorKind::Cancelled),
            Self::UnknownPolicy { .. } => Some(ErrorKind::Fatal),
            Self::Inner(_) => None,
        }
    }

    /// Map the inner error type, leaving policy errors untouched.
    pub fn map_inner<F, U>(self, f: F) -> ResilienceError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Self::TimedOut { elapsed, timeout } => ResilienceError::TimedOut { elapsed, timeout },
            Self::CircuitOpen { policy, consecutive_failures, retry_after } => {
                ResilienceError::CircuitOpen { policy, consecutive_failures, retry_after }
            }
            Self::Cancelled => ResilienceError::Cancelled,
            Self::UnknownPolicy { name } => ResilienceError::UnknownPolicy { name },
            Self::Inner(e) => ResilienceError::Inner(f(e)),
        }
    }
}

impl<E> From<E> for ResilienceError<E> {
    fn from(e: E) -> Self {
        Self::Inner(e)
    }
}

/// Invalid policy configuration, raised when a policy is built rather than when it runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_attempts must be >= 1 (got {0})")]
    InvalidMaxAttempts(u32),
    #[error("backoff_multiplier must be a finite number >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("max_delay ({max:?}) must be >= initial_delay ({initial:?})")]
    MaxDelayBelowInitial { initial: Duration, max: Duration },
    #[error("max_delay must be greater than zero")]
    ZeroMaxDelay,
    #[error("timeout must be non-zero and finite (got {0:?})")]
    InvalidTimeout(Duration),
    #[error("failure_threshold must be >= 1 (got {0})")]
    InvalidFailureThreshold(u32),
    #[error("break_duration must be greater than zero")]
    ZeroBreakDuration,
    #[error("policy name must not be empty")]
    EmptyPolicyName,
}
