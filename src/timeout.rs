//! Per-attempt timeout guard.
//!
//! On expiry the attempt's future is dropped, which cancels it at its next suspension point.
//! Work the operation already handed to another task or a blocking thread keeps running; only
//! the caller stops waiting for it.

use crate::error::{ConfigError, ResilienceError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutGuard {
    duration: Duration,
}

impl TimeoutGuard {
    /// Fails with [`ConfigError::InvalidTimeout`] for a zero duration.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() {
            return Err(ConfigError::InvalidTimeout(duration));
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The budget in whole milliseconds, saturating at `u64::MAX`.
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Await `attempt`, failing with [`ResilienceError::TimedOut`] if it outlives the budget.
    /// The attempt's own error comes back as [`ResilienceError::Inner`].
    pub async fn run<T, E, Fut>(&self, attempt: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, attempt).await {
            Ok(result) => result.map_err(ResilienceError::Inner),
            Err(_) => {
                let elapsed = start.elapsed();
                tracing::debug!(timeout_ms = self.duration_ms(), "attempt timed out");
                Err(ResilienceError::TimedOut { elapsed, timeout: self.duration })
            }
        }
    }
}
