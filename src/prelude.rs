//! Convenient re-exports for common steadfast types.
pub use crate::{
    audit::{AuditEvent, AuditSink},
    circuit_breaker::CircuitState,
    classify::{Classification, Classifier, DownstreamError, Transient},
    config::{PolicyConfig, ResilienceConfig},
    error::{ErrorKind, ResilienceError},
    layer::ResilienceLayer,
    orchestrator::Resilience,
    CancellationToken,
};
