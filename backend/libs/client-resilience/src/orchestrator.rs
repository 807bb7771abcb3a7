//! Composition of rate limiting, circuit breaking and retries
//!
//! Layers always run in this order, whichever subset is configured:
//!
//! ```text
//! execute(op)
//!   └─ RateLimiter::acquire(cost)      admission, may suspend
//!        └─ CircuitBreaker permit      fail fast if unhealthy
//!             └─ RetryExecutor         per-call recovery
//!                  └─ op()
//! ```
//!
//! The breaker sees one outcome per call: the result after all retries.
//! Cancellation, timeouts and rate limit waits never reach it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{ErrorClassifier, RetryAll};
use crate::error::{ConfigError, ResilienceError};
use crate::presets::ResilienceConfig;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryExecutor;
use crate::timeout::with_timeout;

/// One resilient call surface for an API client.
///
/// Cloning is cheap and clones share breaker and limiter state.
pub struct ResilienceOrchestrator<C = RetryAll> {
    name: Arc<str>,
    classifier: Arc<C>,
    retry: Option<RetryExecutor>,
    circuit_breaker: Option<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
    call_timeout: Option<Duration>,
}

impl<C> Clone for ResilienceOrchestrator<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            classifier: self.classifier.clone(),
            retry: self.retry.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            rate_limiter: self.rate_limiter.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<C> std::fmt::Debug for ResilienceOrchestrator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceOrchestrator")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("rate_limiter", &self.rate_limiter)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl<C> ResilienceOrchestrator<C> {
    /// Pass-through orchestrator; add layers with the `with_*` methods.
    pub fn new(name: impl Into<Arc<str>>, classifier: C) -> Self {
        Self {
            name: name.into(),
            classifier: Arc::new(classifier),
            retry: None,
            circuit_breaker: None,
            rate_limiter: None,
            call_timeout: None,
        }
    }

    /// Build every layer named in `config`.
    ///
    /// The breaker and limiter are named after the orchestrator.
    pub fn from_config(
        name: impl Into<Arc<str>>,
        config: &ResilienceConfig,
        classifier: C,
    ) -> Result<Self, ConfigError> {
        let mut orchestrator = Self::new(name, classifier);
        let name = orchestrator.name.clone();

        if let Some(retry) = &config.retry {
            orchestrator.retry = Some(RetryExecutor::try_new(retry.clone())?);
        }
        if let Some(circuit_breaker) = &config.circuit_breaker {
            orchestrator.circuit_breaker =
                Some(CircuitBreaker::try_new(name.clone(), circuit_breaker.clone())?);
        }
        if let Some(rate_limit) = &config.rate_limit {
            orchestrator.rate_limiter = Some(RateLimiter::try_new(name, rate_limit.clone())?);
        }
        if let Some(timeout) = &config.timeout {
            timeout.ensure_valid()?;
            orchestrator.call_timeout = Some(timeout.duration());
        }

        Ok(orchestrator)
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Pass a clone of an existing breaker to share health state between clients.
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreaker) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Pass a clone of an existing limiter to share one quota between clients.
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Deadline applied to every call, covering all layers.
    ///
    /// An expired deadline is reported as [`ResilienceError::TimedOut`] and
    /// is not a breaker failure: the permit is dropped without an outcome,
    /// so a dependency that only ever hangs never opens the circuit.
    /// Bound attempts inside the operation (client request timeouts) when
    /// hangs should count.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn retry_executor(&self) -> Option<&RetryExecutor> {
        self.retry.as_ref()
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Reset every owned layer to its initial state.
    pub fn reset(&self) {
        if let Some(circuit_breaker) = &self.circuit_breaker {
            circuit_breaker.reset();
        }
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.reset();
        }
    }

    /// Run `operation` through every configured layer at unit cost.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E>,
    {
        self.execute_with_cost(operation, 1).await
    }

    /// Run `operation` charging `cost` against the rate limit budget.
    pub async fn execute_with_cost<F, Fut, T, E>(
        &self,
        operation: F,
        cost: u32,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E>,
    {
        let cancel = CancellationToken::new();
        self.execute_cancellable(operation, cost, &cancel).await
    }

    /// Run `operation` under an explicit deadline, overriding the configured one.
    ///
    /// As with [`ResilienceOrchestrator::with_timeout`], expiry does not
    /// count toward the circuit breaker.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        operation: F,
        cost: u32,
        timeout: Duration,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E>,
    {
        let cancel = CancellationToken::new();
        with_timeout(timeout, self.run(operation, cost, &cancel)).await
    }

    /// Run `operation` until it finishes or `cancel` fires.
    ///
    /// Cancellation interrupts rate limit waits, running attempts and
    /// backoff sleeps alike, and yields [`ResilienceError::Cancelled`].
    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        operation: F,
        cost: u32,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E>,
    {
        match self.call_timeout {
            Some(timeout) => with_timeout(timeout, self.run(operation, cost, cancel)).await,
            None => self.run(operation, cost, cancel).await,
        }
    }

    async fn run<F, Fut, T, E>(
        &self,
        operation: F,
        cost: u32,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E>,
    {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_cancellable(cost, cancel).await?;
        }

        let permit = match &self.circuit_breaker {
            Some(circuit_breaker) => Some(circuit_breaker.try_acquire()?),
            None => None,
        };

        let outcome = match &self.retry {
            Some(retry) => {
                retry
                    .execute_cancellable(operation, self.classifier.as_ref(), cancel)
                    .await
            }
            None => {
                RetryExecutor::single_attempt()
                    .execute_cancellable(operation, self.classifier.as_ref(), cancel)
                    .await
            }
        };

        if let Some(permit) = permit {
            match &outcome {
                Ok(_) => permit.record_success(),
                Err(err) if err.is_dependency_failure() => permit.record_failure(),
                Err(err) => {
                    debug!(
                        orchestrator = %self.name,
                        kind = err.kind().as_str(),
                        "Call ended without a dependency outcome"
                    );
                    drop(permit);
                }
            }
        }

        outcome
    }
}
