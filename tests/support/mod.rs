#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use steadfast::{DownstreamError, ManualClock, MemorySink, Resilience, TrackingSleeper};

/// Operation stand-in: counts invocations and fails the first `failures` of them with an
/// `Unavailable` error naming the attempt.
#[derive(Clone, Debug)]
pub struct Flaky {
    calls: Arc<AtomicUsize>,
    failures: usize,
}

impl Flaky {
    pub fn failing(failures: usize) -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)), failures }
    }

    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn healthy() -> Self {
        Self::failing(0)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call(&self) -> impl Future<Output = Result<&'static str, DownstreamError>> + Send + 'static {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.failures;
        async move {
            if n <= failures {
                Err(DownstreamError::unavailable(format!("attempt {n} failed")))
            } else {
                Ok("ok")
            }
        }
    }
}

/// Orchestrator wired for deterministic tests.
pub struct Harness {
    pub resilience: Resilience,
    pub sink: MemorySink,
    pub sleeper: TrackingSleeper,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new() -> Self {
        let sink = MemorySink::new();
        let sleeper = TrackingSleeper::new();
        let clock = ManualClock::new();
        let resilience = Resilience::builder()
            .sink(sink.clone())
            .sleeper(sleeper.clone())
            .clock(clock.clone())
            .build()
            .expect("presets are valid");
        Self { resilience, sink, sleeper, clock }
    }
}
