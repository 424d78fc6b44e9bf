//! Tower integration: route every call of a wrapped service through a named policy.
//!
//! ```rust
//! use steadfast::{DownstreamError, Resilience, ResilienceLayer};
//! use tower::{service_fn, ServiceBuilder, ServiceExt};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let resilience = Resilience::builder().build().unwrap();
//! let client = ServiceBuilder::new()
//!     .layer(ResilienceLayer::new(resilience, "http"))
//!     .service(service_fn(|case_id: u64| async move {
//!         Ok::<_, DownstreamError>(format!("case {case_id}"))
//!     }));
//! assert_eq!(client.oneshot(7).await.unwrap(), "case 7");
//! # });
//! ```

use crate::classify::{Classifier, DefaultClassifier};
use crate::error::ResilienceError;
use crate::orchestrator::Resilience;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Wraps services with the named policy of a [`Resilience`] orchestrator.
#[derive(Clone, Debug)]
pub struct ResilienceLayer<C = DefaultClassifier> {
    resilience: Resilience,
    policy: Arc<str>,
    classifier: Arc<C>,
}

impl ResilienceLayer<DefaultClassifier> {
    /// Classify the service's errors with their own `Transient` implementation.
    pub fn new(resilience: Resilience, policy: impl Into<Arc<str>>) -> Self {
        Self::with_classifier(resilience, policy, DefaultClassifier)
    }
}

impl<C> ResilienceLayer<C> {
    pub fn with_classifier(
        resilience: Resilience,
        policy: impl Into<Arc<str>>,
        classifier: C,
    ) -> Self {
        Self { resilience, policy: policy.into(), classifier: Arc::new(classifier) }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }
}

impl<S, C> Layer<S> for ResilienceLayer<C> {
    type Service = ResilienceService<S, C>;

    fn layer(&self, service: S) -> Self::Service {
        ResilienceService {
            inner: service,
            resilience: self.resilience.clone(),
            policy: self.policy.clone(),
            classifier: self.classifier.clone(),
        }
    }
}

/// Service produced by [`ResilienceLayer`].
#[derive(Clone, Debug)]
pub struct ResilienceService<S, C = DefaultClassifier> {
    inner: S,
    resilience: Resilience,
    policy: Arc<str>,
    classifier: Arc<C>,
}

impl<S, C, Request> Service<Request> for ResilienceService<S, C>
where
    Request: Clone + Send + 'static,
    S: Service<Request> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    C: Classifier<S::Error> + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Each attempt drives readiness on its own clone of the inner service.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let resilience = self.resilience.clone();
        let policy = self.policy.clone();
        let classifier = self.classifier.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            resilience
                .execute_with(&policy, &*classifier, move || inner.clone().oneshot(request.clone()))
                .await
        })
    }
}
