#![forbid(unsafe_code)]

//! # steadfast
//!
//! Resilience policies for outbound calls: retry with exponential backoff, per-policy circuit
//! breakers and per-attempt timeouts, composed into named pipelines with structured audit events
//! for every attempt.
//!
//! ## Features
//!
//! - **Named policies** (`default`, `http`, `database`, plus your own) with validated configs
//! - **Retry executor** with zero-based exponential backoff, optional jitter and pluggable
//!   failure classification
//! - **Circuit breakers** with lazy half-open recovery and a single-probe discipline
//! - **Timeouts** per attempt, reported as a distinct error kind
//! - **Audit sinks** for attempts, retries, call summaries and breaker transitions
//! - **Tower layer** to put any `tower::Service` behind a policy
//!
//! ## Quick Start
//!
//! ```rust
//! use steadfast::{DownstreamError, Resilience};
//!
//! #[tokio::main]
//! async fn main() {
//!     let resilience = Resilience::builder().build().expect("valid presets");
//!
//!     let result = resilience
//!         .http(|| async {
//!             // Your outbound call here
//!             Ok::<_, DownstreamError>("200 OK")
//!         })
//!         .await;
//!     assert_eq!(result.unwrap(), "200 OK");
//! }
//! ```

pub mod audit;
pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod jitter;
pub mod layer;
pub mod orchestrator;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod timeout;

// Re-exports
pub use audit::{AuditEvent, AuditSink, LogSink, MemorySink, NonBlockingSink, NullSink, StreamingSink};
pub use backoff::{Backoff, MAX_BACKOFF};
pub use circuit_breaker::{
    CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState,
    Rejection,
};
pub use classify::{
    Classification, Classifier, DefaultClassifier, DownstreamError, NeverRetry, RetryAll,
    StatusCode, Transient,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{PolicyConfig, PolicyConfigBuilder, ResilienceConfig};
pub use error::{ConfigError, ErrorKind, ResilienceError};
pub use jitter::Jitter;
pub use layer::{ResilienceLayer, ResilienceService};
pub use orchestrator::{Resilience, ResilienceBuilder, DATABASE_POLICY, DEFAULT_POLICY, HTTP_POLICY};
pub use registry::{Policy, PolicyRegistry, RegistryError};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use timeout::TimeoutGuard;
pub use tokio_util::sync::CancellationToken;
