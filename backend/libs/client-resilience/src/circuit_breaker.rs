//! Circuit Breaker with consecutive-failure tripping and bounded half-open probing
//!
//! State transitions:
//! - Closed → Open: when consecutive failures reach `failure_threshold`
//! - Open → HalfOpen: lazily, on the first call or state read after `open_duration`
//! - HalfOpen → Closed: when probe successes reach `success_threshold`
//! - HalfOpen → Open: on any probe failure

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use validator::Validate;

use crate::error::ConfigError;
use crate::metrics::CircuitBreakerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Testing if the dependency recovered, limited probes allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count to trigger circuit open
    #[validate(range(min = 1))]
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive probe successes in HalfOpen to close circuit
    #[validate(range(min = 1))]
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long to stay Open before letting probes through
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    /// Concurrent probes allowed in HalfOpen
    #[validate(range(min = 1))]
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_half_open_max_requests() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }

    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::validation("circuit_breaker", e))
    }
}

/// Fail-fast signal raised by the breaker itself.
///
/// Never counted as a dependency failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker '{name}' is open - failing fast")]
pub struct CircuitOpen {
    pub name: Arc<str>,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error(transparent)]
    Open(CircuitOpen),
    #[error("call failed: {0}")]
    CallFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open(_))
    }
}

/// Point-in-time view of the breaker, for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_in_flight: u32,
    /// Most recent failure in the current state; cleared on every transition
    pub last_failure_at: Option<Instant>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<CircuitBreakerState>>,
}

struct CircuitBreakerState {
    current: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    /// Bumped on every transition and reset; outcomes admitted under an
    /// older generation are ignored
    generation: u64,
}

impl CircuitBreakerState {
    fn initial() -> Self {
        Self {
            current: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_in_flight: 0,
            opened_at: None,
            last_failure_at: None,
            generation: 0,
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state.lock().current)
            .finish()
    }
}

impl CircuitBreaker {
    /// # Panics
    ///
    /// Panics if `config` is invalid. Use [`CircuitBreaker::try_new`] for
    /// configuration loaded at runtime.
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self::try_new(name, config).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_new(
        name: impl Into<Arc<str>>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, ConfigError> {
        config.ensure_valid()?;
        Ok(Self {
            name: name.into(),
            config,
            state: Arc::new(Mutex::new(CircuitBreakerState::initial())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute a future with circuit breaker protection.
    ///
    /// Every `Err` from the operation counts as one failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(CircuitBreakerError::Open)?;

        match f().await {
            Ok(result) => {
                permit.record_success();
                Ok(result)
            }
            Err(e) => {
                permit.record_failure();
                Err(CircuitBreakerError::CallFailed(e))
            }
        }
    }

    /// Ask for admission without running anything.
    ///
    /// The returned permit must be resolved with
    /// [`CallPermit::record_success`] or [`CallPermit::record_failure`].
    /// Dropping it unresolved (cancellation, timeout) frees its half-open
    /// probe slot without recording an outcome.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let mut state = self.state.lock();
        self.refresh(&mut state, Instant::now());

        match state.current {
            CircuitState::Closed => Ok(CallPermit::new(self, state.generation, false)),
            CircuitState::HalfOpen
                if state.half_open_in_flight < self.config.half_open_max_requests =>
            {
                state.half_open_in_flight += 1;
                debug!(
                    breaker = %self.name,
                    in_flight = state.half_open_in_flight,
                    "Circuit breaker: admitting half-open probe"
                );
                Ok(CallPermit::new(self, state.generation, true))
            }
            current => {
                CircuitBreakerMetrics::record_call(&self.name, "rejected");
                debug!(
                    breaker = %self.name,
                    state = current.as_str(),
                    "Circuit breaker: rejecting call"
                );
                Err(CircuitOpen {
                    name: self.name.clone(),
                })
            }
        }
    }

    /// Get current circuit state (for monitoring).
    ///
    /// Applies the same Open → HalfOpen timeout check as admission, so a
    /// stale Open is never reported.
    pub fn state(&self) -> CircuitState {
        let mut state = self.state.lock();
        self.refresh(&mut state, Instant::now());
        state.current
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let mut state = self.state.lock();
        self.refresh(&mut state, Instant::now());
        CircuitMetrics {
            state: state.current,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_in_flight: state.half_open_in_flight,
            last_failure_at: state.last_failure_at,
        }
    }

    /// Force the breaker Closed with zeroed counters.
    ///
    /// Calls admitted before the reset still run, but their outcomes are
    /// discarded.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        let generation = state.generation + 1;
        *state = CircuitBreakerState::initial();
        state.generation = generation;
        info!(breaker = %self.name, "Circuit breaker: reset to Closed");
    }

    fn refresh(&self, state: &mut CircuitBreakerState, now: Instant) {
        if state.current != CircuitState::Open {
            return;
        }
        let elapsed_open = state
            .opened_at
            .map_or(Duration::MAX, |opened_at| now.saturating_duration_since(opened_at));
        if elapsed_open >= self.config.open_duration() {
            self.transition(state, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState, now: Instant) {
        let from = state.current;

        match (from, to) {
            (_, CircuitState::Open) => warn!(
                breaker = %self.name,
                from = from.as_str(),
                failures = state.failure_count,
                "Circuit breaker: {} → Open",
                from.as_str()
            ),
            _ => info!(
                breaker = %self.name,
                "Circuit breaker: {} → {}",
                from.as_str(),
                to.as_str()
            ),
        }

        if from == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                CircuitBreakerMetrics::record_open_duration(
                    &self.name,
                    now.saturating_duration_since(opened_at).as_secs_f64(),
                );
            }
        }
        CircuitBreakerMetrics::record_state_transition(&self.name, from.as_str(), to.as_str());

        state.current = to;
        state.failure_count = 0;
        state.success_count = 0;
        state.half_open_in_flight = 0;
        state.last_failure_at = None;
        state.opened_at = (to == CircuitState::Open).then_some(now);
        state.generation += 1;
    }

    fn on_success(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(breaker = %self.name, "Circuit breaker: ignoring stale success");
            return;
        }
        CircuitBreakerMetrics::record_call(&self.name, "success");

        match state.current {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed, Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!(breaker = %self.name, "Circuit breaker: ignoring stale failure");
            return;
        }
        CircuitBreakerMetrics::record_call(&self.name, "failure");

        let now = Instant::now();

        match state.current {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                // No partial credit: one failed probe reopens
                self.transition(&mut state, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
        // After the transition, so the failure that opened the circuit is kept
        state.last_failure_at = Some(now);
    }

    fn release_probe(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation && state.current == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[must_use = "resolve the permit with record_success or record_failure"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    resolved: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, generation: u64, probe: bool) -> Self {
        Self {
            breaker,
            generation,
            probe,
            resolved: false,
        }
    }

    /// True when this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.generation);
    }

    pub fn record_failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}
