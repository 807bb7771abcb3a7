//! Deadlines and cancellable waits

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use validator::Validate;

use crate::error::{ConfigError, ResilienceError};
use crate::metrics::TimeoutMetrics;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
pub struct TimeoutConfig {
    /// Overall deadline for one call, including rate limit waits and retries
    #[validate(range(min = 1))]
    #[serde(default = "default_timeout_ms")]
    pub duration_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::validation("timeout", e))
    }
}

/// Run a resilient call under a deadline.
///
/// When the deadline elapses the inner future is dropped, which releases any
/// rate limiter queue position and circuit breaker probe slot it held.
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> Result<T, ResilienceError<E>>
where
    F: Future<Output = Result<T, ResilienceError<E>>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(outcome) => {
            TimeoutMetrics::record_operation("completed");
            outcome
        }
        Err(_) => {
            warn!(timeout_ms = duration.as_millis() as u64, "Operation timed out");
            TimeoutMetrics::record_operation("timed_out");
            Err(ResilienceError::TimedOut(duration))
        }
    }
}

/// Marker returned when a wait was interrupted by its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interrupted;

/// Sleep for `duration` unless `cancel` fires first.
pub(crate) async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), Interrupted> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
