//! Audit and telemetry for resilience policies.
//!
//! Every attempt, scheduled retry, completed call, breaker rejection and breaker transition is
//! described by an [`AuditEvent`] and handed to an injected [`AuditSink`]. Sinks are
//! fire-and-forget: `record` is synchronous, returns nothing and must not block, so a slow or
//! broken sink can never stall or fail the call being audited. Sinks that talk to slow
//! destinations should sit behind [`NonBlockingSink`].
//!
//! # Event Types
//!
//! - `Attempt`: one per try, with the 1-based attempt number, start time, duration and outcome
//! - `RetryScheduled`: the backoff delay chosen before the next try
//! - `CallCompleted`: one per `execute` call, the aggregate outcome the breaker saw
//! - `CallRejected`: the breaker refused the call without invoking the operation
//! - `CircuitTransition`: Closed/Open/HalfOpen changes, including administrative resets

pub mod events;
pub mod sinks;

pub use events::{AttemptOutcome, AttemptRecord, AuditEvent, CallSummary};
pub use sinks::{AuditSink, LogSink, MemorySink, NonBlockingSink, NullSink, StreamingSink};
