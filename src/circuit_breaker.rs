//! Circuit breaker: a per-policy Closed / Open / HalfOpen state machine.
//!
//! - **Closed**: calls pass. A failure increments the consecutive-failure count; reaching
//!   `failure_threshold` opens the circuit. A success resets the count.
//! - **Open**: calls are rejected without running the operation. Once `break_duration` has
//!   elapsed since the circuit opened, the next call moves it to HalfOpen. There is no background
//!   timer.
//! - **HalfOpen**: exactly one probe call is admitted. Success closes the circuit, failure reopens
//!   it with a fresh `opened_at`. Calls arriving while the probe is in flight are rejected as if
//!   the circuit were open.
//!
//! The whole state is one enum behind a single mutex, so every transition is atomic. The lock is
//! never held across an `.await`.
//!
//! Callers obtain a [`CallPermit`] from [`CircuitBreaker::try_acquire`] and settle it with the
//! call's outcome. An unsettled permit (panic, cancellation) is settled as neutral when dropped,
//! which frees the half-open probe slot.

use crate::audit::{AuditEvent, AuditSink, NullSink};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, ResilienceError};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the break duration elapses.
    Open,
    /// A single probe is testing recovery.
    HalfOpen,
}

/// Validated breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    break_duration: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, break_duration: Duration) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold(failure_threshold));
        }
        if break_duration.is_zero() {
            return Err(ConfigError::ZeroBreakDuration);
        }
        Ok(Self { failure_threshold, break_duration })
    }

    /// Consecutive call-level failures that open the circuit.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Time spent Open before a probe is admitted.
    pub fn break_duration(&self) -> Duration {
        self.break_duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed { consecutive_failures: u32 },
    Open { opened_at: u64, consecutive_failures: u32 },
    HalfOpen { probe_in_flight: bool, consecutive_failures: u32 },
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    fn consecutive_failures(&self) -> u32 {
        match *self {
            Phase::Closed { consecutive_failures }
            | Phase::Open { consecutive_failures, .. }
            | Phase::HalfOpen { consecutive_failures, .. } => consecutive_failures,
        }
    }
}

#[derive(Debug)]
struct Guarded {
    phase: Phase,
    /// Bumped on every transition; a probe permit only counts within the epoch that issued it.
    generation: u64,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Clock reading when the circuit last opened; `None` unless Open.
    pub opened_at_millis: Option<u64>,
}

/// Rejection returned while the circuit is open or a probe is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub policy: String,
    pub consecutive_failures: u32,
    /// Time until a probe will be admitted; zero while a probe is already running.
    pub retry_after: Duration,
}

impl Rejection {
    pub fn into_error<E>(self) -> ResilienceError<E> {
        ResilienceError::CircuitOpen {
            policy: self.policy,
            consecutive_failures: self.consecutive_failures,
            retry_after: self.retry_after,
        }
    }
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    guarded: Mutex<Guarded>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn AuditSink>,
}

type Transition = (CircuitState, CircuitState, u32);

/// Circuit breaker for one named policy. Clones share the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Breaker on the monotonic clock, reporting transitions nowhere.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_parts(name, config, Arc::new(MonotonicClock::default()), Arc::new(NullSink))
    }

    /// Breaker with an explicit clock and audit sink.
    pub fn with_parts(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                guarded: Mutex::new(Guarded {
                    phase: Phase::Closed { consecutive_failures: 0 },
                    generation: 0,
                }),
                clock,
                sink,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Stored state. An Open circuit whose break has elapsed still reports Open until the next
    /// call moves it to HalfOpen.
    pub fn state(&self) -> CircuitState {
        self.shared.guarded.lock().phase.state()
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let guarded = self.shared.guarded.lock();
        let opened_at_millis = match guarded.phase {
            Phase::Open { opened_at, .. } => Some(opened_at),
            _ => None,
        };
        CircuitSnapshot {
            state: guarded.phase.state(),
            consecutive_failures: guarded.phase.consecutive_failures(),
            opened_at_millis,
        }
    }

    /// Gate check. Admits the call or rejects it without touching the operation.
    pub fn try_acquire(&self) -> Result<CallPermit, Rejection> {
        let now = self.shared.clock.now_millis();
        let break_duration = self.shared.config.break_duration;

        let mut guarded = self.shared.guarded.lock();
        let phase = guarded.phase;
        let (result, transition) = match phase {
            Phase::Closed { .. } => (Ok(false), None),
            Phase::Open { opened_at, consecutive_failures } => {
                let elapsed = Duration::from_millis(now.saturating_sub(opened_at));
                if elapsed >= break_duration {
                    guarded.phase = Phase::HalfOpen { probe_in_flight: true, consecutive_failures };
                    guarded.generation += 1;
                    (
                        Ok(true),
                        Some((CircuitState::Open, CircuitState::HalfOpen, consecutive_failures)),
                    )
                } else {
                    (Err((consecutive_failures, break_duration - elapsed)), None)
                }
            }
            Phase::HalfOpen { probe_in_flight: true, consecutive_failures } => {
                (Err((consecutive_failures, Duration::ZERO)), None)
            }
            Phase::HalfOpen { probe_in_flight: false, consecutive_failures } => {
                guarded.phase = Phase::HalfOpen { probe_in_flight: true, consecutive_failures };
                (Ok(true), None)
            }
        };
        let generation = guarded.generation;
        drop(guarded);

        if let Some(transition) = transition {
            tracing::info!(policy = %self.shared.name, "circuit breaker → half-open");
            self.emit(transition);
        }

        match result {
            Ok(probe) => {
                if probe {
                    tracing::debug!(policy = %self.shared.name, "circuit breaker: admitting half-open probe");
                }
                Ok(CallPermit { breaker: self.clone(), probe, generation, settled: false })
            }
            Err((consecutive_failures, retry_after)) => Err(Rejection {
                policy: self.shared.name.clone(),
                consecutive_failures,
                retry_after,
            }),
        }
    }

    /// Administrative reset: force Closed with a zero failure count, whatever the current state.
    pub fn reset(&self) {
        let mut guarded = self.shared.guarded.lock();
        let previous = guarded.phase;
        guarded.phase = Phase::Closed { consecutive_failures: 0 };
        guarded.generation += 1;
        drop(guarded);

        tracing::info!(policy = %self.shared.name, from = ?previous.state(), "circuit breaker reset");
        if previous.state() != CircuitState::Closed {
            self.emit((previous.state(), CircuitState::Closed, 0));
        }
    }

    /// Run `operation` under breaker protection on its own, without retries or timeouts.
    /// `Inner` and `TimedOut` errors count as failures; other policy errors are neutral.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.try_acquire().map_err(Rejection::into_error)?;
        let result = operation().await;
        match &result {
            Ok(_) => permit.record_success(),
            Err(ResilienceError::Inner(_)) | Err(ResilienceError::TimedOut { .. }) => {
                permit.record_failure()
            }
            Err(_) => permit.release(),
        }
        result
    }

    /// Whether a permit issued in `generation` may still start attempts. A Closed circuit always
    /// admits; a half-open circuit admits only the probe of its own epoch.
    fn admits(&self, probe: bool, generation: u64) -> Result<(), Rejection> {
        let now = self.shared.clock.now_millis();
        let guarded = self.shared.guarded.lock();
        let phase = guarded.phase;
        let current = guarded.generation;
        drop(guarded);

        let (consecutive_failures, retry_after) = match phase {
            Phase::Closed { .. } => return Ok(()),
            Phase::HalfOpen { .. } if probe && current == generation => return Ok(()),
            Phase::HalfOpen { consecutive_failures, .. } => (consecutive_failures, Duration::ZERO),
            Phase::Open { opened_at, consecutive_failures } => {
                let elapsed = Duration::from_millis(now.saturating_sub(opened_at));
                (consecutive_failures, self.shared.config.break_duration.saturating_sub(elapsed))
            }
        };
        Err(Rejection { policy: self.shared.name.clone(), consecutive_failures, retry_after })
    }

    fn on_success(&self, probe: bool, generation: u64) {
        let mut guarded = self.shared.guarded.lock();
        let phase = guarded.phase;
        let transition = match phase {
            Phase::Closed { .. } => {
                guarded.phase = Phase::Closed { consecutive_failures: 0 };
                None
            }
            Phase::HalfOpen { consecutive_failures, .. }
                if probe && guarded.generation == generation =>
            {
                guarded.phase = Phase::Closed { consecutive_failures: 0 };
                guarded.generation += 1;
                Some((CircuitState::HalfOpen, CircuitState::Closed, consecutive_failures))
            }
            // Stale outcome from a call admitted before the circuit opened.
            _ => None,
        };
        drop(guarded);

        if let Some(transition) = transition {
            tracing::info!(policy = %self.shared.name, "circuit breaker → closed");
            self.emit(transition);
        }
    }

    fn on_failure(&self, probe: bool, generation: u64) {
        let now = self.shared.clock.now_millis();
        let threshold = self.shared.config.failure_threshold;

        let mut guarded = self.shared.guarded.lock();
        let phase = guarded.phase;
        let transition = match phase {
            Phase::Closed { consecutive_failures } => {
                let failures = consecutive_failures.saturating_add(1);
                if failures >= threshold {
                    guarded.phase = Phase::Open { opened_at: now, consecutive_failures: failures };
                    guarded.generation += 1;
                    Some((CircuitState::Closed, CircuitState::Open, failures))
                } else {
                    guarded.phase = Phase::Closed { consecutive_failures: failures };
                    None
                }
            }
            Phase::HalfOpen { consecutive_failures, .. }
                if probe && guarded.generation == generation =>
            {
                let failures = consecutive_failures.saturating_add(1);
                guarded.phase = Phase::Open { opened_at: now, consecutive_failures: failures };
                guarded.generation += 1;
                Some((CircuitState::HalfOpen, CircuitState::Open, failures))
            }
            // Already open, or a stale non-probe outcome: opening again would be a no-op.
            _ => None,
        };
        drop(guarded);

        match transition {
            Some((CircuitState::Closed, _, failures)) => {
                tracing::error!(policy = %self.shared.name, failures, threshold, "circuit breaker → open");
                self.emit((CircuitState::Closed, CircuitState::Open, failures));
            }
            Some(transition) => {
                tracing::warn!(policy = %self.shared.name, failures = transition.2, "circuit breaker: probe failed → open");
                self.emit(transition);
            }
            None => {}
        }
    }

    fn on_neutral(&self, probe: bool, generation: u64) {
        if !probe {
            return;
        }
        let mut guarded = self.shared.guarded.lock();
        if guarded.generation != generation {
            return;
        }
        if let Phase::HalfOpen { probe_in_flight: true, consecutive_failures } = guarded.phase {
            guarded.phase = Phase::HalfOpen { probe_in_flight: false, consecutive_failures };
        }
    }

    fn emit(&self, (from, to, consecutive_failures): Transition) {
        self.shared.sink.record(AuditEvent::CircuitTransition {
            policy: self.shared.name.clone(),
            from,
            to,
            consecutive_failures,
        });
    }
}

/// How one call counts against the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Leaves the failure count alone (fatal errors, cancellation, a call cut short because the
    /// circuit opened under it). A fatal error from the half-open probe does not reopen the
    /// circuit: the probe slot is freed and the next call probes again.
    Neutral,
}

/// Admission ticket for one call. Settle it with exactly one outcome.
#[must_use = "a permit must be settled with the call's outcome"]
pub struct CallPermit {
    breaker: CircuitBreaker,
    probe: bool,
    generation: u64,
    settled: bool,
}

impl std::fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPermit")
            .field("policy", &self.breaker.name())
            .field("probe", &self.probe)
            .finish()
    }
}

impl CallPermit {
    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Re-check the gate before a follow-up attempt. Fails once the circuit has opened, or a
    /// newer half-open epoch has started, since this permit was issued.
    pub fn check(&self) -> Result<(), Rejection> {
        self.breaker.admits(self.probe, self.generation)
    }

    pub fn settle(self, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success => self.record_success(),
            CallOutcome::Failure => self.record_failure(),
            CallOutcome::Neutral => self.release(),
        }
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe, self.generation);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.probe, self.generation);
    }

    /// Neither success nor failure: the count is untouched and a probe slot is freed.
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_neutral(self.probe, self.generation);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_neutral(self.probe, self.generation);
        }
    }
}
