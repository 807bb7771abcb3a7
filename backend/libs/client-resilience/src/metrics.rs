//! Prometheus metrics for the resilience kernel
//!
//! Collectors register with the default registry on first use. Without the
//! `metrics` feature every recorder compiles to nothing.

#[cfg(feature = "metrics")]
mod registry {
    use once_cell::sync::Lazy;
    use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

    pub(super) static BREAKER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
        register_int_counter_vec!(
            "client_resilience_circuit_breaker_state_transitions_total",
            "Circuit breaker state transitions",
            &["name", "from", "to"]
        )
        .expect("Failed to register circuit breaker transitions metric")
    });

    pub(super) static BREAKER_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
        register_int_counter_vec!(
            "client_resilience_circuit_breaker_calls_total",
            "Circuit breaker outcomes and rejections",
            &["name", "result"]
        )
        .expect("Failed to register circuit breaker calls metric")
    });

    pub(super) static BREAKER_OPEN_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
        register_histogram_vec!(
            "client_resilience_circuit_breaker_open_duration_seconds",
            "Time a breaker stayed open before probing",
            &["name"]
        )
        .expect("Failed to register circuit breaker open duration metric")
    });

    pub(super) static DEADLINE_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
        register_int_counter_vec!(
            "client_resilience_timeout_operations_total",
            "Calls run under a deadline, by outcome",
            &["result"]
        )
        .expect("Failed to register timeout operations metric")
    });

    pub(super) static RETRY_ATTEMPTS: Lazy<HistogramVec> = Lazy::new(|| {
        register_histogram_vec!(
            "client_resilience_retry_attempts",
            "Attempts used per call, by final outcome",
            &["result"],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 7.0, 10.0]
        )
        .expect("Failed to register retry attempts metric")
    });

    pub(super) static LIMITER_WAIT_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
        register_histogram_vec!(
            "client_resilience_rate_limiter_wait_seconds",
            "Time callers queued for rate limit budget",
            &["name"],
            vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register rate limiter wait metric")
    });
}

pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    pub fn record_state_transition(name: &str, from: &str, to: &str) {
        #[cfg(feature = "metrics")]
        registry::BREAKER_TRANSITIONS
            .with_label_values(&[name, from, to])
            .inc();
        #[cfg(not(feature = "metrics"))]
        let _ = (name, from, to);
    }

    /// `result` is one of `success`, `failure`, `rejected`
    pub fn record_call(name: &str, result: &str) {
        #[cfg(feature = "metrics")]
        registry::BREAKER_CALLS.with_label_values(&[name, result]).inc();
        #[cfg(not(feature = "metrics"))]
        let _ = (name, result);
    }

    pub fn record_open_duration(name: &str, duration_secs: f64) {
        #[cfg(feature = "metrics")]
        registry::BREAKER_OPEN_SECONDS
            .with_label_values(&[name])
            .observe(duration_secs);
        #[cfg(not(feature = "metrics"))]
        let _ = (name, duration_secs);
    }
}

pub struct TimeoutMetrics;

impl TimeoutMetrics {
    pub fn record_operation(result: &str) {
        #[cfg(feature = "metrics")]
        registry::DEADLINE_OUTCOMES.with_label_values(&[result]).inc();
        #[cfg(not(feature = "metrics"))]
        let _ = result;
    }
}

pub struct RetryMetrics;

impl RetryMetrics {
    pub fn record_attempts(result: &str, attempts: u32) {
        #[cfg(feature = "metrics")]
        registry::RETRY_ATTEMPTS
            .with_label_values(&[result])
            .observe(f64::from(attempts));
        #[cfg(not(feature = "metrics"))]
        let _ = (result, attempts);
    }
}

pub struct RateLimiterMetrics;

impl RateLimiterMetrics {
    pub fn record_wait(name: &str, wait_secs: f64) {
        #[cfg(feature = "metrics")]
        registry::LIMITER_WAIT_SECONDS
            .with_label_values(&[name])
            .observe(wait_secs);
        #[cfg(not(feature = "metrics"))]
        let _ = (name, wait_secs);
    }
}
