//! Backoff strategies for retry policies.
//!
//! Attempt semantics are zero-based: `delay(0)` is the wait before the first retry, `delay(1)`
//! the wait before the second, and so on. The initial call never waits.
//!
//! The exponential strategy computes `min(initial * multiplier^attempt, max)`. For a fixed
//! configuration every strategy is monotonically non-decreasing until it reaches its cap, then
//! constant.
//!
//! ```rust
//! use std::time::Duration;
//! use steadfast::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(200))
//!     .with_multiplier(2.0)
//!     .unwrap()
//!     .with_max(Duration::from_secs(5))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::from_millis(200));
//! assert_eq!(backoff.delay(1), Duration::from_millis(400));
//! assert_eq!(backoff.delay(2), Duration::from_millis(800));
//! assert_eq!(backoff.delay(10), Duration::from_secs(5)); // capped
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to [`MAX_BACKOFF`] (1 day)
//! before the configured cap is applied.

use crate::error::ConfigError;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
enum BackoffKind {
    Constant { delay: Duration },
    Linear { base: Duration, max: Option<Duration> },
    Exponential { initial: Duration, multiplier: f64, max: Option<Duration> },
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant { delay } }
    }

    /// `base * (attempt + 1)`.
    pub fn linear(base: Duration) -> Self {
        Self { kind: BackoffKind::Linear { base, max: None } }
    }

    /// `initial * 2^attempt` until a multiplier or cap is set.
    pub fn exponential(initial: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { initial, multiplier: 2.0, max: None } }
    }

    /// Set the growth factor of an exponential backoff. Must be finite and >= 1 so the schedule
    /// never shrinks. Ignored by other strategies.
    pub fn with_multiplier(mut self, factor: f64) -> Result<Self, ConfigError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(ConfigError::InvalidMultiplier(factor));
        }
        if let BackoffKind::Exponential { multiplier, .. } = &mut self.kind {
            *multiplier = factor;
        }
        Ok(self)
    }

    /// Cap the delay. Errors if `max` is zero or below the starting delay.
    /// A constant backoff is already capped at its delay, so the call only validates.
    pub fn with_max(mut self, cap: Duration) -> Result<Self, ConfigError> {
        if cap.is_zero() {
            return Err(ConfigError::ZeroMaxDelay);
        }
        match &mut self.kind {
            BackoffKind::Exponential { initial: start, max, .. }
            | BackoffKind::Linear { base: start, max } => {
                if cap < *start {
                    return Err(ConfigError::MaxDelayBelowInitial { initial: *start, max: cap });
                }
                *max = Some(cap);
            }
            BackoffKind::Constant { delay } => {
                if cap < *delay {
                    return Err(ConfigError::MaxDelayBelowInitial { initial: *delay, max: cap });
                }
            }
        }
        Ok(self)
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: usize) -> Duration {
        let raw = match &self.kind {
            BackoffKind::Constant { delay } => *delay,
            BackoffKind::Linear { base, max } => {
                let steps = attempt.saturating_add(1).min(u32::MAX as usize) as u32;
                let linear = base.checked_mul(steps).unwrap_or(MAX_BACKOFF);
                cap(linear, *max)
            }
            BackoffKind::Exponential { initial, multiplier, max } => {
                let exponent = attempt.min(i32::MAX as usize) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                let grown = if secs.is_finite() && secs < MAX_BACKOFF.as_secs_f64() {
                    Duration::from_secs_f64(secs)
                } else {
                    MAX_BACKOFF
                };
                cap(grown, *max)
            }
        };
        raw.min(MAX_BACKOFF)
    }

    /// Upper bound of the schedule, if any.
    pub fn max(&self) -> Option<Duration> {
        match &self.kind {
            BackoffKind::Constant { delay } => Some(*delay),
            BackoffKind::Linear { max, .. } | BackoffKind::Exponential { max, .. } => *max,
        }
    }
}

fn cap(delay: Duration, max: Option<Duration>) -> Duration {
    max.map(|m| delay.min(m)).unwrap_or(delay)
}
