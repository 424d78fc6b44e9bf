use crate::circuit_breaker::CircuitState;
use crate::config::millis;
use crate::error::ErrorKind;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    TimedOut,
}

/// One try of an operation. Produced per attempt, consumed by the sink and discarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub policy: String,
    /// 1-based attempt number within the call.
    pub attempt: u32,
    pub started_at: SystemTime,
    #[serde(rename = "duration_ms", serialize_with = "millis::serialize")]
    pub duration: Duration,
    pub outcome: AttemptOutcome,
    /// Classification of the failure; `None` on success.
    pub error_kind: Option<ErrorKind>,
}

/// Aggregate result of one `execute` call, as recorded by the circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSummary {
    pub policy: String,
    pub attempts: u32,
    #[serde(rename = "duration_ms", serialize_with = "millis::serialize")]
    pub duration: Duration,
    /// `None` when the call succeeded.
    pub error_kind: Option<ErrorKind>,
}

impl CallSummary {
    pub fn succeeded(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// Structured audit event emitted by the resilience layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Attempt(AttemptRecord),
    RetryScheduled {
        policy: String,
        /// Attempt number that will run after the delay.
        next_attempt: u32,
        #[serde(rename = "delay_ms", serialize_with = "millis::serialize")]
        delay: Duration,
    },
    CallCompleted(CallSummary),
    CallRejected {
        policy: String,
        consecutive_failures: u32,
        #[serde(rename = "retry_after_ms", serialize_with = "millis::serialize")]
        retry_after: Duration,
    },
    CircuitTransition {
        policy: String,
        from: CircuitState,
        to: CircuitState,
        consecutive_failures: u32,
    },
}

impl AuditEvent {
    /// Name of the policy the event belongs to.
    pub fn policy(&self) -> &str {
        match self {
            AuditEvent::Attempt(record) => &record.policy,
            AuditEvent::CallCompleted(summary) => &summary.policy,
            AuditEvent::RetryScheduled { policy, .. }
            | AuditEvent::CallRejected { policy, .. }
            | AuditEvent::CircuitTransition { policy, .. } => policy,
        }
    }

    pub fn as_attempt(&self) -> Option<&AttemptRecord> {
        match self {
            AuditEvent::Attempt(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_call(&self) -> Option<&CallSummary> {
        match self {
            AuditEvent::CallCompleted(summary) => Some(summary),
            _ => None,
        }
    }

    /// Render the event as a JSON object (one line per event in JSONL sinks).
    #[cfg(feature = "telemetry-json")]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::Attempt(r) => {
                write!(f, "Attempt({}#{}, {:?}, {:?}", r.policy, r.attempt, r.outcome, r.duration)?;
                if let Some(kind) = r.error_kind {
                    write!(f, ", {}", kind)?;
                }
                write!(f, ")")
            }
            AuditEvent::RetryScheduled { policy, next_attempt, delay } => {
                write!(f, "RetryScheduled({}#{}, delay={:?})", policy, next_attempt, delay)
            }
            AuditEvent::CallCompleted(s) => match s.error_kind {
                None => write!(f, "CallCompleted({}, attempts={}, ok)", s.policy, s.attempts),
                Some(kind) => {
                    write!(f, "CallCompleted({}, attempts={}, {})", s.policy, s.attempts, kind)
                }
            },
            AuditEvent::CallRejected { policy, retry_after, .. } => {
                write!(f, "CallRejected({}, retry_after={:?})", policy, retry_after)
            }
            AuditEvent::CircuitTransition { policy, from, to, .. } => {
                write!(f, "CircuitTransition({}, {:?} -> {:?})", policy, from, to)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(outcome: AttemptOutcome, error_kind: Option<ErrorKind>) -> AuditEvent {
        AuditEvent::Attempt(AttemptRecord {
            policy: "database".into(),
            attempt: 2,
            started_at: SystemTime::UNIX_EPOCH,
            duration: Duration::from_millis(12),
            outcome,
            error_kind,
        })
    }

    #[test]
    fn display_is_compact() {
        let event = attempt(AttemptOutcome::Failure, Some(ErrorKind::Transient));
        assert_eq!(event.to_string(), "Attempt(database#2, Failure, 12ms, transient)");

        let transition = AuditEvent::CircuitTransition {
            policy: "http".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            consecutive_failures: 5,
        };
        assert_eq!(transition.to_string(), "CircuitTransition(http, Closed -> Open)");
    }

    #[test]
    fn policy_accessor_covers_variants() {
        assert_eq!(attempt(AttemptOutcome::Success, None).policy(), "database");
        let rejected = AuditEvent::CallRejected {
            policy: "http".into(),
            consecutive_failures: 5,
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(rejected.policy(), "http");
        assert!(rejected.as_attempt().is_none());
    }

    #[test]
    fn serializes_with_kind_tag_and_millis() {
        let value = serde_json::to_value(attempt(AttemptOutcome::TimedOut, Some(ErrorKind::TimedOut)))
            .unwrap();
        assert_eq!(value["kind"], "attempt");
        assert_eq!(value["duration_ms"], 12);
        assert_eq!(value["outcome"], "timed_out");
        assert_eq!(value["error_kind"], "timed_out");

        let scheduled = AuditEvent::RetryScheduled {
            policy: "http".into(),
            next_attempt: 2,
            delay: Duration::from_millis(200),
        };
        let value = serde_json::to_value(scheduled).unwrap();
        assert_eq!(value["kind"], "retry_scheduled");
        assert_eq!(value["delay_ms"], 200);
    }
}
