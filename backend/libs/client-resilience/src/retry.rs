//! Retry executor with exponential backoff and jitter

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use validator::Validate;

use crate::classifier::{ErrorClass, ErrorClassifier};
use crate::error::{ConfigError, ResilienceError};
use crate::metrics::RetryMetrics;
use crate::timeout::sleep_or_cancel;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Validate)]
pub struct RetryConfig {
    /// Total attempts including the first one
    #[validate(range(min = 1))]
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the second attempt
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on computed backoff
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff growth per attempt, must be > 1
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the delay (0.0 - 1.0)
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::validation("retry", e))?;

        if !self.multiplier.is_finite() || self.multiplier <= 1.0 {
            return Err(ConfigError::inconsistent(
                "retry",
                format!("multiplier must be greater than 1.0, got {}", self.multiplier),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::inconsistent(
                "retry",
                format!(
                    "max_delay_ms ({}) is below initial_delay_ms ({})",
                    self.max_delay_ms, self.initial_delay_ms
                ),
            ));
        }
        Ok(())
    }
}

/// Repeats one logical operation until it succeeds, fails permanently, or
/// runs out of attempts.
///
/// Attempts of one call never overlap. The executor holds no per-call state,
/// so one instance can serve any number of concurrent calls.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// # Panics
    ///
    /// Panics if `config` is invalid. Use [`RetryExecutor::try_new`] for
    /// configuration loaded at runtime.
    pub fn new(config: RetryConfig) -> Self {
        Self::try_new(config).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_new(config: RetryConfig) -> Result<Self, ConfigError> {
        config.ensure_valid()?;
        Ok(Self { config })
    }

    pub(crate) fn single_attempt() -> Self {
        Self {
            config: RetryConfig::no_retry(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Computed backoff (before jitter) after the `attempt`-th failure.
    ///
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        // 0 * inf is NaN once the exponent overflows
        if self.config.initial_delay_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = (self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent))
            .min(self.config.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let millis = delay.as_millis() as f64;
        let spread = millis * self.config.jitter_factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((millis + offset).max(0.0) as u64)
    }

    /// Execute `operation` with retries.
    pub async fn execute<F, Fut, T, E, C>(
        &self,
        operation: F,
        classifier: &C,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E> + ?Sized,
    {
        let cancel = CancellationToken::new();
        self.execute_cancellable(operation, classifier, &cancel).await
    }

    /// Execute `operation` with retries, stopping promptly once `cancel` fires.
    ///
    /// Cancellation interrupts both a running attempt and a backoff sleep and
    /// yields [`ResilienceError::Cancelled`].
    pub async fn execute_cancellable<F, Fut, T, E, C>(
        &self,
        mut operation: F,
        classifier: &C,
        cancel: &CancellationToken,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: ErrorClassifier<E> + ?Sized,
    {
        let max_attempts = self.config.max_attempts;
        let mut attempts = 0u32;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(attempts, "Retry loop cancelled");
                    return Err(ResilienceError::Cancelled);
                }
                outcome = operation() => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    RetryMetrics::record_attempts("success", attempts + 1);
                    return Ok(value);
                }
                Err(error) => error,
            };
            attempts += 1;

            let class = classifier.classify(&error);
            if !class.is_retryable() {
                debug!(attempts, "Non-retryable failure, giving up");
                RetryMetrics::record_attempts("permanent", attempts);
                return Err(ResilienceError::Permanent { error, attempts });
            }

            if attempts >= max_attempts {
                warn!(attempts, max_attempts, "Max attempts reached");
                RetryMetrics::record_attempts("exhausted", attempts);
                return Err(ResilienceError::Exhausted { error, attempts });
            }

            // A dependency-provided wait is honoured as-is
            let delay = match class {
                ErrorClass::RateLimited(hint) => hint,
                _ => self.apply_jitter(self.backoff_delay(attempts)),
            };

            warn!(
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                hinted = matches!(class, ErrorClass::RateLimited(_)),
                "Retrying after transient failure"
            );

            if sleep_or_cancel(delay, cancel).await.is_err() {
                debug!(attempts, "Retry backoff cancelled");
                return Err(ResilienceError::Cancelled);
            }
        }
    }
}
