use super::events::AuditEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Receiver of audit events.
///
/// Implementations must return promptly and must not panic; errors are handled (or dropped)
/// inside the sink and never reach the call being audited.
pub trait AuditSink: Send + Sync + fmt::Debug {
    fn record(&self, event: AuditEvent);
}

impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    fn record(&self, event: AuditEvent) {
        (**self).record(event)
    }
}

/// Discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Writes events through `tracing` under the `steadfast::audit` target.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl AuditSink for LogSink {
    fn record(&self, event: AuditEvent) {
        match &event {
            AuditEvent::CallRejected { .. } | AuditEvent::CircuitTransition { .. } => {
                tracing::info!(target: "steadfast::audit", policy = event.policy(), event = %event, "audit_event")
            }
            _ => tracing::debug!(target: "steadfast::audit", policy = event.policy(), event = %event, "audit_event"),
        }
    }
}

/// Keeps the most recent events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Events for one policy, oldest first.
    pub fn events_for(&self, policy: &str) -> Vec<AuditEvent> {
        self.events.lock().iter().filter(|e| e.policy() == policy).cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: AuditEvent) {
        let mut guard = self.events.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
    }
}

/// Broadcasts events to any number of subscribers. Events sent with no subscriber are counted
/// as dropped.
#[derive(Clone, Debug)]
pub struct StreamingSink {
    sender: tokio::sync::broadcast::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
    last_drop_ns: Arc<AtomicU64>,
}

impl StreamingSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
            last_drop_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AuditEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn last_drop(&self) -> Option<SystemTime> {
        match self.last_drop_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => UNIX_EPOCH.checked_add(Duration::from_nanos(ns)),
        }
    }
}

impl AuditSink for StreamingSink {
    fn record(&self, event: AuditEvent) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            self.last_drop_ns
                .store(u64::try_from(now.as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);
        }
    }
}

/// Offloads events to a bounded channel drained by a worker task that drives any
/// `tower::Service<AuditEvent>` (an HTTP collector, a file writer, a message producer).
///
/// `record` never waits: when the channel is full the event is dropped and counted. Errors from
/// the wrapped service are logged at debug level and discarded. Must be constructed inside a
/// tokio runtime.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl NonBlockingSink {
    pub fn with_capacity<S>(mut service: S, capacity: usize) -> Self
    where
        S: tower::Service<AuditEvent, Response = ()> + Send + 'static,
        S::Error: fmt::Display + Send + 'static,
        S::Future: Send + 'static,
    {
        let capacity = capacity.max(1);
        let (tx, mut rx) = tokio::sync::mpsc::channel::<AuditEvent>(capacity);

        tokio::spawn(async move {
            use tower::{Service, ServiceExt};
            while let Some(event) = rx.recv().await {
                match ServiceExt::<AuditEvent>::ready(&mut service).await {
                    Ok(ready) => {
                        if let Err(e) = ready.call(event).await {
                            tracing::debug!(target: "steadfast::audit", error = %e, "audit sink call failed");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(target: "steadfast::audit", error = %e, "audit sink not ready; stopping worker");
                        break;
                    }
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)), capacity }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingSink")
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl AuditSink for NonBlockingSink {
    fn record(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::events::{AttemptOutcome, AttemptRecord};
    use crate::circuit_breaker::CircuitState;
    use std::convert::Infallible;

    fn sample(attempt: u32) -> AuditEvent {
        AuditEvent::Attempt(AttemptRecord {
            policy: "http".into(),
            attempt,
            started_at: SystemTime::now(),
            duration: Duration::from_millis(1),
            outcome: AttemptOutcome::Success,
            error_kind: None,
        })
    }

    #[test]
    fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        sink.record(sample(1));
        sink.record(sample(2));
        sink.record(sample(3));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        let attempts: Vec<u32> =
            sink.events().iter().filter_map(|e| e.as_attempt()).map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![2, 3]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn memory_sink_filters_by_policy() {
        let sink = MemorySink::new();
        sink.record(sample(1));
        sink.record(AuditEvent::CircuitTransition {
            policy: "database".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            consecutive_failures: 5,
        });
        assert_eq!(sink.events_for("database").len(), 1);
        assert_eq!(sink.events_for("http").len(), 1);
    }

    #[test]
    fn shared_sink_through_arc() {
        let sink = Arc::new(MemorySink::new());
        let dyn_sink: Arc<dyn AuditSink> = sink.clone();
        dyn_sink.record(sample(1));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn streaming_sink_counts_drops_without_subscribers() {
        let sink = StreamingSink::new(4);
        sink.record(sample(1));
        assert_eq!(sink.dropped_count(), 1);
        assert!(sink.last_drop().is_some());
    }

    #[tokio::test]
    async fn streaming_sink_delivers_to_subscriber() {
        let sink = StreamingSink::new(8);
        let mut rx = sink.subscribe();
        sink.record(sample(7));
        let got = rx.recv().await.expect("event");
        assert_eq!(got.as_attempt().map(|r| r.attempt), Some(7));
        assert_eq!(sink.dropped_count(), 0);
    }

    #[tokio::test]
    async fn non_blocking_sink_forwards_to_service() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let service = tower::service_fn(move |event: AuditEvent| {
            let seen = seen_clone.clone();
            async move {
                seen.lock().push(event);
                Ok::<_, Infallible>(())
            }
        });

        let sink = NonBlockingSink::with_capacity(service, 16);
        sink.record(sample(1));
        sink.record(sample(2));

        for _ in 0..50 {
            if seen.lock().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn non_blocking_sink_survives_service_errors() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let service = tower::service_fn(move |event: AuditEvent| {
            let seen = seen_clone.clone();
            async move {
                if event.as_attempt().map(|r| r.attempt) == Some(1) {
                    return Err(std::io::Error::other("collector down"));
                }
                seen.lock().push(event);
                Ok(())
            }
        });

        let sink = NonBlockingSink::with_capacity(service, 4);
        sink.record(sample(1));
        sink.record(sample(2));

        for _ in 0..50 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let delivered: Vec<u32> =
            seen.lock().iter().filter_map(|e| e.as_attempt().map(|r| r.attempt)).collect();
        assert_eq!(delivered, vec![2], "the event after the failed one still arrives");
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn log_sink_accepts_every_variant() {
        LogSink.record(sample(1));
        LogSink.record(AuditEvent::CallRejected {
            policy: "http".into(),
            consecutive_failures: 5,
            retry_after: Duration::from_secs(1),
        });
        NullSink.record(sample(2));
    }
}
