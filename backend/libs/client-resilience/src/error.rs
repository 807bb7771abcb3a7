//! Error types shared by every layer of the kernel
//!
//! Callers get back exactly one [`ResilienceError`] per failed call. When the
//! dependency itself failed, the original error is carried unchanged inside
//! [`ResilienceError::Permanent`] or [`ResilienceError::Exhausted`] so it can
//! still be matched on.

use std::time::Duration;

use crate::circuit_breaker::CircuitOpen;
use crate::rate_limiter::AcquireError;

/// Coarse classification of a failed call, for logging and fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The dependency returned an error the classifier marked non-retryable
    Permanent,
    /// Every attempt failed with a retryable error
    Exhausted,
    /// Rejected by the circuit breaker without invoking the dependency
    CircuitOpen,
    /// The caller cancelled the call
    Cancelled,
    /// The call deadline elapsed
    TimedOut,
    /// The requested cost can never fit in the rate limit budget
    OverCapacity,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Permanent => "permanent",
            FailureKind::Exhausted => "exhausted",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::Cancelled => "cancelled",
            FailureKind::TimedOut => "timed_out",
            FailureKind::OverCapacity => "over_capacity",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E> {
    #[error("non-retryable failure after {attempts} attempt(s): {error}")]
    Permanent { error: E, attempts: u32 },

    #[error("retries exhausted after {attempts} attempt(s): {error}")]
    Exhausted { error: E, attempts: u32 },

    #[error(transparent)]
    CircuitOpen(CircuitOpen),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("requested cost {cost} exceeds rate limit capacity {capacity}")]
    CostExceedsCapacity { cost: u32, capacity: u32 },
}

impl<E> ResilienceError<E> {
    pub fn kind(&self) -> FailureKind {
        match self {
            ResilienceError::Permanent { .. } => FailureKind::Permanent,
            ResilienceError::Exhausted { .. } => FailureKind::Exhausted,
            ResilienceError::CircuitOpen(_) => FailureKind::CircuitOpen,
            ResilienceError::Cancelled => FailureKind::Cancelled,
            ResilienceError::TimedOut(_) => FailureKind::TimedOut,
            ResilienceError::CostExceedsCapacity { .. } => FailureKind::OverCapacity,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen(_))
    }

    /// True when the dependency was actually invoked and failed.
    ///
    /// Only these outcomes count against a circuit breaker.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            ResilienceError::Permanent { .. } | ResilienceError::Exhausted { .. }
        )
    }

    /// Number of attempts made before giving up, if the dependency was invoked.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ResilienceError::Permanent { attempts, .. }
            | ResilienceError::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Borrow the last underlying dependency error, if there is one.
    pub fn inner(&self) -> Option<&E> {
        match self {
            ResilienceError::Permanent { error, .. } | ResilienceError::Exhausted { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    /// Take the last underlying dependency error, if there is one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Permanent { error, .. } | ResilienceError::Exhausted { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    pub fn map_inner<F, E2>(self, f: F) -> ResilienceError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            ResilienceError::Permanent { error, attempts } => ResilienceError::Permanent {
                error: f(error),
                attempts,
            },
            ResilienceError::Exhausted { error, attempts } => ResilienceError::Exhausted {
                error: f(error),
                attempts,
            },
            ResilienceError::CircuitOpen(open) => ResilienceError::CircuitOpen(open),
            ResilienceError::Cancelled => ResilienceError::Cancelled,
            ResilienceError::TimedOut(duration) => ResilienceError::TimedOut(duration),
            ResilienceError::CostExceedsCapacity { cost, capacity } => {
                ResilienceError::CostExceedsCapacity { cost, capacity }
            }
        }
    }
}

impl<E> From<CircuitOpen> for ResilienceError<E> {
    fn from(open: CircuitOpen) -> Self {
        ResilienceError::CircuitOpen(open)
    }
}

impl<E> From<AcquireError> for ResilienceError<E> {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Cancelled => ResilienceError::Cancelled,
            AcquireError::CostExceedsCapacity { cost, capacity } => {
                ResilienceError::CostExceedsCapacity { cost, capacity }
            }
        }
    }
}

/// Invalid configuration handed to a `try_new` constructor.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {component} config: {source}")]
    Validation {
        component: &'static str,
        #[source]
        source: validator::ValidationErrors,
    },

    #[error("invalid {component} config: {reason}")]
    Inconsistent {
        component: &'static str,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn validation(component: &'static str, source: validator::ValidationErrors) -> Self {
        ConfigError::Validation { component, source }
    }

    pub(crate) fn inconsistent(component: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Inconsistent {
            component,
            reason: reason.into(),
        }
    }
}
