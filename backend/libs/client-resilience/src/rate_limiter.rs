//! Rate limiter for outbound calls
//!
//! Budget is tracked as a sliding one-minute ledger of admissions: capacity
//! consumed by a call comes back exactly one minute later. This gives a hard
//! guarantee that no rolling 60 second window ever admits more than the
//! configured ceiling, even when many waiters wake at the same instant.
//!
//! **Fairness:** callers queue on a FIFO async mutex, so budget goes to the
//! earliest request first. Only the head of the queue sleeps on the budget
//! timer; everybody behind it waits for their turn.
//!
//! **Backpressure, not failure:** `acquire` suspends until budget exists. It
//! only errors when the requested cost can never fit, or on cancellation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use validator::Validate;

use crate::error::ConfigError;
use crate::metrics::RateLimiterMetrics;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
pub struct RateLimitConfig {
    /// Call starts allowed per rolling minute
    #[validate(range(min = 1))]
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Optional second budget (e.g. LLM tokens) drained by each call's cost
    #[validate(range(min = 1))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_minute: Option<u32>,
}

fn default_requests_per_minute() -> u32 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            cost_per_minute: None,
        }
    }
}

impl RateLimitConfig {
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::validation("rate_limit", e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AcquireError {
    #[error("requested cost {cost} exceeds rate limit capacity {capacity}")]
    CostExceedsCapacity { cost: u32, capacity: u32 },
    #[error("rate limit wait cancelled")]
    Cancelled,
}

/// Remaining budget in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub requests_remaining: u32,
    pub cost_remaining: Option<u32>,
}

/// What one admission takes out of each budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Charge {
    requests: u32,
    cost: u32,
}

struct Admission {
    at: Instant,
    charge: Charge,
}

#[derive(Default)]
struct Ledger {
    admissions: VecDeque<Admission>,
    requests_used: u64,
    cost_used: u64,
}

impl Ledger {
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.admissions.front() {
            if now.saturating_duration_since(front.at) < WINDOW {
                break;
            }
            self.requests_used -= u64::from(front.charge.requests);
            self.cost_used -= u64::from(front.charge.cost);
            self.admissions.pop_front();
        }
    }

    /// Record the admission, or return how long until it would fit.
    fn try_admit(
        &mut self,
        charge: Charge,
        config: &RateLimitConfig,
        now: Instant,
    ) -> Result<(), Duration> {
        self.prune(now);

        let fits = |requests_used: u64, cost_used: u64| {
            requests_used + u64::from(charge.requests) <= u64::from(config.requests_per_minute)
                && config
                    .cost_per_minute
                    .map_or(true, |cap| cost_used + u64::from(charge.cost) <= u64::from(cap))
        };

        if fits(self.requests_used, self.cost_used) {
            self.requests_used += u64::from(charge.requests);
            self.cost_used += u64::from(charge.cost);
            self.admissions.push_back(Admission { at: now, charge });
            return Ok(());
        }

        let mut requests_used = self.requests_used;
        let mut cost_used = self.cost_used;
        for admission in &self.admissions {
            requests_used -= u64::from(admission.charge.requests);
            cost_used -= u64::from(admission.charge.cost);
            if fits(requests_used, cost_used) {
                return Err((admission.at + WINDOW).saturating_duration_since(now));
            }
        }
        // Unreachable for charges within capacity: an empty ledger always fits
        Err(WINDOW)
    }

    fn remaining(&self, config: &RateLimitConfig) -> RateLimitSnapshot {
        let requests = u64::from(config.requests_per_minute).saturating_sub(self.requests_used);
        RateLimitSnapshot {
            requests_remaining: requests as u32,
            cost_remaining: config
                .cost_per_minute
                .map(|cap| u64::from(cap).saturating_sub(self.cost_used) as u32),
        }
    }
}

struct RateLimiterInner {
    name: Arc<str>,
    config: RateLimitConfig,
    /// tokio's Mutex grants the lock in request order
    queue: tokio::sync::Mutex<()>,
    ledger: Mutex<Ledger>,
    budget_restored: Notify,
}

/// Shared handle; clones draw from the same budget.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl RateLimiter {
    /// # Panics
    ///
    /// Panics if `config` is invalid. Use [`RateLimiter::try_new`] for
    /// configuration loaded at runtime.
    pub fn new(name: impl Into<Arc<str>>, config: RateLimitConfig) -> Self {
        Self::try_new(name, config).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_new(name: impl Into<Arc<str>>, config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.ensure_valid()?;
        Ok(Self {
            inner: Arc::new(RateLimiterInner {
                name: name.into(),
                config,
                queue: tokio::sync::Mutex::new(()),
                ledger: Mutex::new(Ledger::default()),
                budget_restored: Notify::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Wait until `cost` units of budget are available, then take them.
    ///
    /// Without a cost budget the cost drains the request budget directly
    /// (minimum one unit). With `cost_per_minute` configured each call takes
    /// one request unit plus `cost` cost units.
    pub async fn acquire(&self, cost: u32) -> Result<(), AcquireError> {
        let cancel = CancellationToken::new();
        self.acquire_cancellable(cost, &cancel).await
    }

    /// [`RateLimiter::acquire`] that gives up its queue position as soon as
    /// `cancel` fires.
    pub async fn acquire_cancellable(
        &self,
        cost: u32,
        cancel: &CancellationToken,
    ) -> Result<(), AcquireError> {
        let charge = self.charge_for(cost)?;
        let queued_at = Instant::now();

        let _turn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            turn = self.inner.queue.lock() => turn,
        };

        loop {
            // Created before checking so a concurrent reset is never missed
            let restored = self.inner.budget_restored.notified();

            let admitted = {
                let mut ledger = self.inner.ledger.lock();
                ledger.try_admit(charge, &self.inner.config, Instant::now())
            };

            let wait = match admitted {
                Ok(()) => {
                    let waited = queued_at.elapsed();
                    if !waited.is_zero() {
                        RateLimiterMetrics::record_wait(&self.inner.name, waited.as_secs_f64());
                    }
                    return Ok(());
                }
                Err(wait) => wait,
            };

            debug!(
                limiter = %self.inner.name,
                cost,
                wait_ms = wait.as_millis() as u64,
                "Rate limit budget exhausted, waiting"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(limiter = %self.inner.name, "Rate limit wait cancelled");
                    return Err(AcquireError::Cancelled);
                }
                _ = restored => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Remaining budget right now.
    pub fn available(&self) -> RateLimitSnapshot {
        let mut ledger = self.inner.ledger.lock();
        ledger.prune(Instant::now());
        ledger.remaining(&self.inner.config)
    }

    /// Restore the full budget and wake the head waiter.
    pub fn reset(&self) {
        *self.inner.ledger.lock() = Ledger::default();
        self.inner.budget_restored.notify_waiters();
        info!(limiter = %self.inner.name, "Rate limiter: budget reset");
    }

    fn charge_for(&self, cost: u32) -> Result<Charge, AcquireError> {
        let config = &self.inner.config;
        match config.cost_per_minute {
            Some(capacity) if cost > capacity => {
                Err(AcquireError::CostExceedsCapacity { cost, capacity })
            }
            Some(_) => Ok(Charge { requests: 1, cost }),
            None => {
                let units = cost.max(1);
                if units > config.requests_per_minute {
                    return Err(AcquireError::CostExceedsCapacity {
                        cost: units,
                        capacity: config.requests_per_minute,
                    });
                }
                Ok(Charge {
                    requests: units,
                    cost: 0,
                })
            }
        }
    }
}
