//! Retry executor for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - After a failed attempt the error is classified. Operation errors go through the caller's
//!   [`Classifier`]; a timed-out attempt is retryable when `retry_on_timeout` is set.
//! - Fatal errors return immediately; on exhaustion the last error is returned unchanged.
//! - Before retry `n` (zero-based) the task suspends for `backoff.delay(n)`, jittered, through
//!   the injected [`Sleeper`].
//! - A cancellation token, when supplied, is raced against every attempt and every backoff wait.
//! - Under an orchestrator, the call's breaker permit is re-checked before every attempt after the
//!   first. If the circuit opened meanwhile, the call stops with [`ResilienceError::CircuitOpen`]
//!   and settles as neutral.
//!
//! Every attempt is reported to the audit sink as an [`AuditEvent::Attempt`], and every wait as
//! an [`AuditEvent::RetryScheduled`] carrying the computed delay.
//!
//! ```rust
//! use std::time::Duration;
//! use steadfast::{Backoff, Classification, InstantSleeper, RetryPolicy};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::constant(Duration::from_millis(100)))
//!     .sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let retry_everything = |_: &std::io::Error| Classification::Retryable;
//! let result: Result<(), _> = policy
//!     .execute(|| async { Err(std::io::Error::other("refused")) }, &retry_everything)
//!     .await;
//! assert_eq!(result.unwrap_err().into_inner().unwrap().to_string(), "refused");
//! # });
//! ```

use crate::audit::{AttemptOutcome, AttemptRecord, AuditEvent, AuditSink, NullSink};
use crate::backoff::Backoff;
use crate::circuit_breaker::{CallOutcome, CallPermit};
use crate::classify::{Classification, Classifier};
use crate::config::PolicyConfig;
use crate::error::{ConfigError, ErrorKind, ResilienceError};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::timeout::TimeoutGuard;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Bounded retry loop with backoff, optional per-attempt timeout and audit reporting.
#[derive(Clone)]
pub struct RetryPolicy {
    name: String,
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    timeout: Option<TimeoutGuard>,
    retry_on_timeout: bool,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("timeout", &self.timeout)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .finish()
    }
}

/// Everything the orchestrator needs to account for one call.
#[derive(Debug)]
pub(crate) struct RetryReport<T, E> {
    pub result: Result<T, ResilienceError<E>>,
    pub attempts: u32,
    pub outcome: CallOutcome,
    pub error_kind: Option<ErrorKind>,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Retry policy for a named policy config, timeouts included.
    pub fn from_config(
        name: impl Into<String>,
        config: &PolicyConfig,
        sleeper: Arc<dyn Sleeper>,
        sink: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            max_attempts: config.max_attempts(),
            backoff: config.backoff()?,
            jitter: config.jitter(),
            timeout: Some(TimeoutGuard::new(config.timeout())?),
            retry_on_timeout: config.retry_on_timeout(),
            sleeper,
            sink,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(|guard| guard.duration())
    }

    /// Run `operation` until it succeeds, fails fatally or runs out of attempts.
    pub async fn execute<T, E, Fut, Op, C>(
        &self,
        operation: Op,
        classifier: &C,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
    {
        self.run(operation, classifier, None, None).await.result
    }

    /// Like [`execute`](Self::execute), aborting promptly with [`ResilienceError::Cancelled`]
    /// once `token` is cancelled.
    pub async fn execute_cancellable<T, E, Fut, Op, C>(
        &self,
        operation: Op,
        classifier: &C,
        token: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
    {
        self.run(operation, classifier, Some(token), None).await.result
    }

    pub(crate) async fn run<T, E, Fut, Op, C>(
        &self,
        mut operation: Op,
        classifier: &C,
        token: Option<&CancellationToken>,
        gate: Option<&CallPermit>,
    ) -> RetryReport<T, E>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
    {
        let mut attempt: u32 = 1;
        loop {
            if token.is_some_and(CancellationToken::is_cancelled) {
                return cancelled(attempt - 1);
            }
            if attempt > 1 {
                if let Some(Err(rejection)) = gate.map(CallPermit::check) {
                    tracing::debug!(policy = %self.name, attempt, "circuit opened during the call; not retrying");
                    self.sink.record(AuditEvent::CallRejected {
                        policy: rejection.policy.clone(),
                        consecutive_failures: rejection.consecutive_failures,
                        retry_after: rejection.retry_after,
                    });
                    return RetryReport {
                        result: Err(rejection.into_error()),
                        attempts: attempt - 1,
                        outcome: CallOutcome::Neutral,
                        error_kind: Some(ErrorKind::CircuitOpen),
                    };
                }
            }

            let started_at = SystemTime::now();
            let start = Instant::now();
            let guarded = async {
                match &self.timeout {
                    Some(guard) => guard.run(operation()).await,
                    None => operation().await.map_err(ResilienceError::Inner),
                }
            };
            let result = tokio::select! {
                biased;
                _ = wait_cancelled(token) => Err(ResilienceError::Cancelled),
                result = guarded => result,
            };
            let duration = start.elapsed();

            let error = match result {
                Ok(value) => {
                    self.record_attempt(attempt, started_at, duration, AttemptOutcome::Success, None);
                    return RetryReport {
                        result: Ok(value),
                        attempts: attempt,
                        outcome: CallOutcome::Success,
                        error_kind: None,
                    };
                }
                Err(ResilienceError::Cancelled) => return cancelled(attempt),
                Err(error) => error,
            };

            let (classification, kind, outcome) = match &error {
                ResilienceError::TimedOut { .. } => {
                    let classification = if self.retry_on_timeout {
                        Classification::Retryable
                    } else {
                        Classification::Fatal
                    };
                    (classification, ErrorKind::TimedOut, AttemptOutcome::TimedOut)
                }
                ResilienceError::Inner(e) => {
                    let classification = classifier.classify(e);
                    (classification, classification.error_kind(), AttemptOutcome::Failure)
                }
                // The timeout guard only yields `Inner` or `TimedOut`.
                other => {
                    let kind = other.policy_kind().unwrap_or(ErrorKind::Fatal);
                    (Classification::Fatal, kind, AttemptOutcome::Failure)
                }
            };
            self.record_attempt(attempt, started_at, duration, outcome, Some(kind));

            // Timeouts always count against the breaker; fatal operation errors never do.
            let call_outcome = match kind {
                ErrorKind::Transient | ErrorKind::TimedOut => CallOutcome::Failure,
                _ => CallOutcome::Neutral,
            };

            if !classification.is_retryable() {
                tracing::debug!(policy = %self.name, attempt, error_kind = %kind, "not retrying");
                return RetryReport {
                    result: Err(error),
                    attempts: attempt,
                    outcome: call_outcome,
                    error_kind: Some(kind),
                };
            }
            if attempt >= self.max_attempts {
                tracing::debug!(policy = %self.name, attempts = attempt, "retries exhausted");
                return RetryReport {
                    result: Err(error),
                    attempts: attempt,
                    outcome: call_outcome,
                    error_kind: Some(kind),
                };
            }

            let retry_index = usize::try_from(attempt - 1).unwrap_or(usize::MAX);
            let delay = self.jitter.apply_within(
                self.backoff.delay(retry_index),
                self.backoff.delay(retry_index.saturating_add(1)),
            );
            tracing::debug!(
                policy = %self.name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error_kind = %kind,
                "retrying after failure"
            );
            self.sink.record(AuditEvent::RetryScheduled {
                policy: self.name.clone(),
                next_attempt: attempt + 1,
                delay,
            });

            tokio::select! {
                biased;
                _ = wait_cancelled(token) => return cancelled(attempt),
                _ = self.sleeper.sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn record_attempt(
        &self,
        attempt: u32,
        started_at: SystemTime,
        duration: Duration,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
    ) {
        self.sink.record(AuditEvent::Attempt(AttemptRecord {
            policy: self.name.clone(),
            attempt,
            started_at,
            duration,
            outcome,
            error_kind,
        }));
    }
}

fn cancelled<T, E>(attempts: u32) -> RetryReport<T, E> {
    RetryReport {
        result: Err(ResilienceError::Cancelled),
        attempts,
        outcome: CallOutcome::Neutral,
        error_kind: Some(ErrorKind::Cancelled),
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Builder for a standalone [`RetryPolicy`]. Defaults: 4 attempts, exponential backoff from
/// 200ms doubling, no jitter, no timeout, tokio sleeper, no audit sink.
pub struct RetryPolicyBuilder {
    name: String,
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    timeout: Option<Duration>,
    retry_on_timeout: bool,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn AuditSink>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 4,
            backoff: Backoff::exponential(Duration::from_millis(200)),
            jitter: Jitter::None,
            timeout: None,
            retry_on_timeout: true,
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(NullSink),
        }
    }

    /// Policy name used in audit events and logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound every attempt by `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: AuditSink + 'static,
    {
        self.sink = Arc::new(sink);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        let timeout = self.timeout.map(TimeoutGuard::new).transpose()?;
        Ok(RetryPolicy {
            name: self.name,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            timeout,
            retry_on_timeout: self.retry_on_timeout,
            sleeper: self.sleeper,
            sink: self.sink,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
