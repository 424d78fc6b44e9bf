//! Jitter strategies to spread retries from many callers.
//!
//! - `None`: exact backoff delays. The default.
//! - `Upward`: uniform in `[delay, next delay]`, where the next delay is what the following retry
//!   would wait unjittered. The schedule stays non-decreasing until it reaches the cap, where the
//!   window closes and delays are exact.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`, keeps a floor while adding randomness.
//!
//! `Full` and `Equal` trade the non-decreasing schedule for wider spread: a later retry may wait
//! less than an earlier one, and `Full` may not wait at all. No mode exceeds the configured
//! `max_delay`.

use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Full jitter: random between 0 and delay
    Full,
    /// Equal jitter: random between delay/2 and delay
    Equal,
    /// Random between the delay and the next unjittered delay; never shortens the schedule
    Upward,
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    pub fn upward() -> Self {
        Jitter::Upward
    }

    /// Apply jitter to a delay duration. `Upward` has no window here and returns `delay`.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_within(delay, delay)
    }

    /// Apply jitter to `delay`, where `next` is the unjittered delay of the following retry.
    pub fn apply_within(&self, delay: Duration, next: Duration) -> Duration {
        match self {
            Jitter::None => delay,
            _ => self.apply_within_rng(delay, next, &mut rng()),
        }
    }

    /// [`apply_within`](Self::apply_within) with a caller-supplied RNG.
    pub fn apply_within_rng<R: Rng>(&self, delay: Duration, next: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::Upward => {
                let low = as_millis_saturated(delay);
                let high = as_millis_saturated(next);
                if high <= low {
                    return delay;
                }
                Duration::from_millis(rng.random_range(low..=high))
            }
            _ => self.apply_with_rng(delay, rng),
        }
    }

    /// Apply jitter with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = as_millis_saturated(delay);
        match self {
            Jitter::None | Jitter::Upward => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(millis / 2..=millis))
            }
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
