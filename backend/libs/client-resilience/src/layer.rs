//! Tower Layer integration: run every request of a service through an orchestrator

use futures_util::future::BoxFuture;
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};
use tower_layer::Layer;

use crate::classifier::ErrorClassifier;
use crate::error::ResilienceError;
use crate::orchestrator::ResilienceOrchestrator;

/// Resilience Layer for Tower services
///
/// Requests must be `Clone`: a retried request is sent again as-is.
pub struct ResilienceLayer<C> {
    orchestrator: ResilienceOrchestrator<C>,
}

impl<C> Clone for ResilienceLayer<C> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
        }
    }
}

impl<C> ResilienceLayer<C> {
    pub fn new(orchestrator: ResilienceOrchestrator<C>) -> Self {
        Self { orchestrator }
    }
}

impl<S, C> Layer<S> for ResilienceLayer<C> {
    type Service = ResilienceService<S, C>;

    fn layer(&self, service: S) -> Self::Service {
        ResilienceService {
            inner: service,
            orchestrator: self.orchestrator.clone(),
        }
    }
}

pub struct ResilienceService<S, C> {
    inner: S,
    orchestrator: ResilienceOrchestrator<C>,
}

impl<S: Clone, C> Clone for ResilienceService<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            orchestrator: self.orchestrator.clone(),
        }
    }
}

impl<S, C> ResilienceService<S, C> {
    pub fn orchestrator(&self) -> &ResilienceOrchestrator<C> {
        &self.orchestrator
    }
}

impl<S, C, Request> Service<Request> for ResilienceService<S, C>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send,
    S::Error: Send,
    C: ErrorClassifier<S::Error> + 'static,
    Request: Clone + Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is awaited per attempt on a clone of the inner service
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let orchestrator = self.orchestrator.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            orchestrator
                .execute(move || {
                    let service = inner.clone();
                    let req = req.clone();
                    async move { service.oneshot(req).await }
                })
                .await
        })
    }
}
