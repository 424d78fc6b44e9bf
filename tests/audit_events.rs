mod support;

use std::time::Duration;
use steadfast::{
    AuditEvent, CircuitState, DownstreamError, ErrorKind, Resilience, StreamingSink,
};
use steadfast::audit::AttemptOutcome;
use support::{Flaky, Harness};

fn transitions(events: &[AuditEvent]) -> Vec<(CircuitState, CircuitState)> {
    events
        .iter()
        .filter_map(|e| match e {
            AuditEvent::CircuitTransition { from, to, .. } => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn one_attempt_record_per_try_and_one_summary_per_call() {
    let h = Harness::new();
    let op = Flaky::failing(2);
    h.resilience.execute("default", || op.call()).await.unwrap();

    let events = h.sink.events_for("default");
    let attempts: Vec<_> = events.iter().filter_map(|e| e.as_attempt()).collect();
    assert_eq!(attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(
        attempts.iter().map(|a| a.outcome).collect::<Vec<_>>(),
        vec![AttemptOutcome::Failure, AttemptOutcome::Failure, AttemptOutcome::Success]
    );
    assert!(attempts[..2].iter().all(|a| a.error_kind == Some(ErrorKind::Transient)));

    let scheduled: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            AuditEvent::RetryScheduled { next_attempt, delay, .. } => Some((*next_attempt, *delay)),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![(2, Duration::from_millis(200)), (3, Duration::from_millis(400))]);

    let summaries: Vec<_> = events.iter().filter_map(|e| e.as_call()).collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].attempts, 3);
    assert!(summaries[0].succeeded());
}

#[tokio::test]
async fn breaker_lifecycle_is_audited() {
    let h = Harness::new();
    let failing = Flaky::always_failing();
    for _ in 0..5 {
        let _ = h.resilience.http(|| failing.call()).await;
    }
    h.clock.advance(Duration::from_secs(30));
    let healthy = Flaky::healthy();
    h.resilience.http(|| healthy.call()).await.unwrap();

    for _ in 0..5 {
        let _ = h.resilience.http(|| failing.call()).await;
    }
    h.resilience.reset_circuit_breaker("http").unwrap();

    assert_eq!(
        transitions(&h.sink.events_for("http")),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn streaming_sink_feeds_subscribers() {
    let sink = StreamingSink::new(64);
    let mut rx = sink.subscribe();
    let resilience = Resilience::builder()
        .sink(sink.clone())
        .sleeper(steadfast::InstantSleeper)
        .build()
        .unwrap();

    resilience.database(|| async { Ok::<_, DownstreamError>(()) }).await.unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.as_attempt().map(|a| a.attempt), Some(1));
    let second = rx.recv().await.unwrap();
    assert_eq!(second.as_call().map(|c| c.policy.as_str()), Some("database"));
    assert_eq!(sink.dropped_count(), 0);
}

#[tokio::test]
async fn events_serialize_to_stable_json() {
    let h = Harness::new();
    let op = Flaky::failing(1);
    h.resilience.execute("default", || op.call()).await.unwrap();

    let values: Vec<serde_json::Value> = h
        .sink
        .events()
        .iter()
        .map(|e| serde_json::to_value(e).unwrap())
        .collect();
    let kinds: Vec<&str> = values.iter().map(|v| v["kind"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["attempt", "retry_scheduled", "attempt", "call_completed"]);
    assert_eq!(values[0]["policy"], "default");
    assert_eq!(values[0]["error_kind"], "transient");
    assert_eq!(values[1]["delay_ms"], 200);
    assert_eq!(values[3]["attempts"], 2);
}
