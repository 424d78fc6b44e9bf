//! Resilience orchestrator: named policy pipelines.
//!
//! `execute(name, op)` looks the policy up, asks its circuit breaker for a permit once, runs the
//! retry loop (each attempt under the policy's timeout), then settles the permit with one
//! aggregate outcome for the whole call. The breaker therefore counts call-level failures, not
//! raw attempts.
//!
//! ```rust
//! use steadfast::{DownstreamError, Resilience};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let resilience = Resilience::builder().build().unwrap();
//! let rows = resilience
//!     .database(|| async { Ok::<_, DownstreamError>(vec![1, 2, 3]) })
//!     .await
//!     .unwrap();
//! assert_eq!(rows.len(), 3);
//! # });
//! ```

use crate::audit::{AuditEvent, AuditSink, CallSummary, LogSink};
use crate::circuit_breaker::{CircuitSnapshot, CircuitState};
use crate::classify::{Classifier, DefaultClassifier, Transient};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{PolicyConfig, ResilienceConfig};
use crate::error::{ConfigError, ResilienceError};
use crate::registry::{Policy, PolicyRegistry, RegistryError};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const DEFAULT_POLICY: &str = "default";
pub const HTTP_POLICY: &str = "http";
pub const DATABASE_POLICY: &str = "database";

struct Inner {
    registry: PolicyRegistry,
    sink: Arc<dyn AuditSink>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

/// Entry point for running operations under named policies. Cheap to clone; clones share
/// policies and breaker state.
#[derive(Clone)]
pub struct Resilience {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Resilience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resilience")
            .field("policies", &self.inner.registry.names())
            .field("sink", &self.inner.sink)
            .finish()
    }
}

impl Resilience {
    pub fn builder() -> ResilienceBuilder {
        ResilienceBuilder::new()
    }

    /// Orchestrator with the built-in presets overlaid by `config`.
    pub fn from_config(config: &ResilienceConfig) -> Result<Self, ConfigError> {
        Self::builder().config(config).build()
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.inner.registry
    }

    /// Register (or replace) a policy at runtime, sharing this orchestrator's sink, sleeper and
    /// clock.
    pub fn register(
        &self,
        name: impl Into<String>,
        config: PolicyConfig,
    ) -> Result<(), ConfigError> {
        let policy = Policy::new(
            name,
            config,
            self.inner.sleeper.clone(),
            self.inner.clock.clone(),
            self.inner.sink.clone(),
        )?;
        self.inner.registry.register(policy);
        Ok(())
    }

    /// Run `operation` under the named policy, retrying the errors it reports as transient.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        policy: &str,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient,
    {
        self.run(policy, &DefaultClassifier, None, operation).await
    }

    /// Run `operation` under the named policy with a caller-supplied classifier.
    pub async fn execute_with<T, E, Fut, Op, C>(
        &self,
        policy: &str,
        classifier: &C,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
    {
        self.run(policy, classifier, None, operation).await
    }

    /// Like [`execute`](Self::execute), returning [`ResilienceError::Cancelled`] promptly once
    /// `token` fires. Cancellation does not count against the breaker.
    pub async fn execute_cancellable<T, E, Fut, Op>(
        &self,
        policy: &str,
        token: &CancellationToken,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient,
    {
        self.run(policy, &DefaultClassifier, Some(token), operation).await
    }

    /// Shorthand for `execute("http", operation)`.
    pub async fn http<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient,
    {
        self.execute(HTTP_POLICY, operation).await
    }

    /// Shorthand for `execute("database", operation)`.
    pub async fn database<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient,
    {
        self.execute(DATABASE_POLICY, operation).await
    }

    pub fn circuit_state(&self, policy: &str) -> Result<CircuitState, RegistryError> {
        self.inner.registry.state(policy)
    }

    pub fn circuit_snapshot(&self, policy: &str) -> Result<CircuitSnapshot, RegistryError> {
        self.inner
            .registry
            .get(policy)
            .map(|p| p.breaker().snapshot())
            .ok_or_else(|| RegistryError::NotFound(policy.to_string()))
    }

    /// Administrative recovery: force the named breaker Closed with a zero failure count.
    pub fn reset_circuit_breaker(&self, policy: &str) -> Result<(), RegistryError> {
        self.inner.registry.reset(policy)
    }

    pub fn reset_all_circuit_breakers(&self) {
        self.inner.registry.reset_all()
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    async fn run<T, E, Fut, Op, C>(
        &self,
        name: &str,
        classifier: &C,
        token: Option<&CancellationToken>,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
    {
        let Some(policy) = self.inner.registry.get(name) else {
            tracing::warn!(policy = %name, "no resilience policy registered under this name");
            return Err(ResilienceError::UnknownPolicy { name: name.to_string() });
        };

        let permit = match policy.breaker().try_acquire() {
            Ok(permit) => permit,
            Err(rejection) => {
                tracing::debug!(
                    policy = %name,
                    retry_after_ms = u64::try_from(rejection.retry_after.as_millis()).unwrap_or(u64::MAX),
                    "call rejected by open circuit"
                );
                self.inner.sink.record(AuditEvent::CallRejected {
                    policy: rejection.policy.clone(),
                    consecutive_failures: rejection.consecutive_failures,
                    retry_after: rejection.retry_after,
                });
                return Err(rejection.into_error());
            }
        };

        let span = tracing::debug_span!("resilience_call", policy = %name, probe = permit.is_probe());
        async move {
            let start = Instant::now();
            let report = policy.retry().run(operation, classifier, token, Some(&permit)).await;
            permit.settle(report.outcome);

            let summary = CallSummary {
                policy: policy.name().to_string(),
                attempts: report.attempts,
                duration: start.elapsed(),
                error_kind: report.error_kind,
            };
            tracing::debug!(
                attempts = summary.attempts,
                duration_ms = u64::try_from(summary.duration.as_millis()).unwrap_or(u64::MAX),
                ok = summary.succeeded(),
                "resilience call finished"
            );
            self.inner.sink.record(AuditEvent::CallCompleted(summary));
            report.result
        }
        .instrument(span)
        .await
    }
}

/// Builder for [`Resilience`]. Starts with the `default`, `http` and `database` presets, a
/// [`LogSink`], the tokio sleeper and the monotonic clock.
pub struct ResilienceBuilder {
    policies: BTreeMap<String, PolicyConfig>,
    sink: Arc<dyn AuditSink>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl ResilienceBuilder {
    pub fn new() -> Self {
        let mut policies = BTreeMap::new();
        policies.insert(DEFAULT_POLICY.to_string(), PolicyConfig::default());
        policies.insert(HTTP_POLICY.to_string(), PolicyConfig::http());
        policies.insert(DATABASE_POLICY.to_string(), PolicyConfig::database());
        Self {
            policies,
            sink: Arc::new(LogSink),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Add or replace a named policy.
    pub fn policy(mut self, name: impl Into<String>, config: PolicyConfig) -> Self {
        self.policies.insert(name.into(), config);
        self
    }

    /// Overlay every policy from `config` on the current set.
    /// Replace policies with the entries of a loaded config. Fields a settings file leaves out
    /// were already filled from the preset of the same name.
    pub fn config(mut self, config: &ResilienceConfig) -> Self {
        for (name, policy) in &config.policies {
            self.policies.insert(name.clone(), policy.clone());
        }
        self
    }

    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: AuditSink + 'static,
    {
        self.sink = Arc::new(sink);
        self
    }

    pub fn shared_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Result<Resilience, ConfigError> {
        let registry = PolicyRegistry::new();
        for (name, config) in self.policies {
            registry.register(Policy::new(
                name,
                config,
                self.sleeper.clone(),
                self.clock.clone(),
                self.sink.clone(),
            )?);
        }
        Ok(Resilience {
            inner: Arc::new(Inner {
                registry,
                sink: self.sink,
                sleeper: self.sleeper,
                clock: self.clock,
            }),
        })
    }
}

impl Default for ResilienceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::classify::{Classification, DownstreamError};
    use crate::clock::ManualClock;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resilience(sink: &MemorySink) -> Resilience {
        Resilience::builder()
            .sink(sink.clone())
            .sleeper(InstantSleeper)
            .clock(ManualClock::new())
            .build()
            .unwrap()
    }

    #[test]
    fn presets_are_registered() {
        let r = resilience(&MemorySink::new());
        assert_eq!(r.policy_names(), vec!["database", "default", "http"]);
        assert_eq!(
            r.registry().get("database").map(|p| p.config().timeout()),
            Some(std::time::Duration::from_secs(5))
        );
    }

    #[tokio::test]
    async fn unknown_policy_fails_without_running() {
        let r = resilience(&MemorySink::new());
        let calls = &AtomicUsize::new(0);
        let err = r
            .execute("payments", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DownstreamError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_unknown_policy());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_errors_leave_the_breaker_alone() {
        let sink = MemorySink::new();
        let r = resilience(&sink);
        let calls = &AtomicUsize::new(0);
        for _ in 0..10 {
            let err = r
                .http(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(DownstreamError::invalid_argument("bad case id"))
                })
                .await
                .unwrap_err();
            assert_eq!(err.into_inner().map(|e| e.message().to_string()), Some("bad case id".into()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10, "fatal errors are never retried");
        assert_eq!(r.circuit_snapshot("http").unwrap().consecutive_failures, 0);
        assert_eq!(r.circuit_state("http").unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn custom_classifier_is_honoured() {
        let r = resilience(&MemorySink::new());
        let calls = &AtomicUsize::new(0);
        let only_once = |_: &String| Classification::Fatal;
        let result: Result<(), _> = r
            .execute_with("default", &only_once, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err().into_inner(), Some("nope".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn emits_one_call_summary_per_execute() {
        let sink = MemorySink::new();
        let r = resilience(&sink);
        let calls = &AtomicUsize::new(0);
        r.database(move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DownstreamError::unavailable("failover"))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap();

        let summaries: Vec<_> =
            sink.events().iter().filter_map(|e| e.as_call().cloned()).collect();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].policy, "database");
        assert_eq!(summaries[0].attempts, 2);
        assert!(summaries[0].succeeded());
    }

    #[tokio::test]
    async fn runtime_registration_replaces_policy() {
        let r = resilience(&MemorySink::new());
        r.register("http", PolicyConfig::builder().max_attempts(1).build().unwrap()).unwrap();
        let calls = &AtomicUsize::new(0);
        let _ = r
            .http(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DownstreamError::unavailable("down"))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(r.register("", PolicyConfig::default()).is_err());
    }
}
