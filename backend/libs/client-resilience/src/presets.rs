//! Preset configurations for common dependency types

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::timeout::TimeoutConfig;

/// Configuration bundle for one API client.
///
/// A missing section means that layer is not used.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<TimeoutConfig>,
}

impl ResilienceConfig {
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        if let Some(retry) = &self.retry {
            retry.ensure_valid()?;
        }
        if let Some(circuit_breaker) = &self.circuit_breaker {
            circuit_breaker.ensure_valid()?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.ensure_valid()?;
        }
        if let Some(timeout) = &self.timeout {
            timeout.ensure_valid()?;
        }
        Ok(())
    }
}

/// LLM completion APIs (token-metered)
///
/// - Rate limit: 60 req/min, 90k tokens/min
/// - Circuit breaker: 5 failures, 60s cooldown
/// - Retry: 4 attempts, long backoff (providers overload under burst)
/// - Timeout: 120s (long generations)
pub fn llm_api_config() -> ResilienceConfig {
    ResilienceConfig {
        retry: Some(RetryConfig {
            max_attempts: 4,
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.25,
        }),
        circuit_breaker: Some(CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_ms: 60_000,
            half_open_max_requests: 1,
        }),
        rate_limit: Some(RateLimitConfig {
            requests_per_minute: 60,
            cost_per_minute: Some(90_000),
        }),
        timeout: Some(TimeoutConfig {
            duration_ms: 120_000,
        }),
    }
}

/// Payment provider APIs
///
/// - Rate limit: 100 req/min
/// - Circuit breaker: 3 failures, 30s cooldown
/// - Retry: 2 attempts only (writes must carry idempotency keys)
/// - Timeout: 30s
pub fn payment_api_config() -> ResilienceConfig {
    ResilienceConfig {
        retry: Some(RetryConfig {
            max_attempts: 2,
            initial_delay_ms: 500,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            jitter_factor: 0.25,
        }),
        circuit_breaker: Some(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 3,
            open_duration_ms: 30_000,
            half_open_max_requests: 1,
        }),
        rate_limit: Some(RateLimitConfig {
            requests_per_minute: 100,
            cost_per_minute: None,
        }),
        timeout: Some(TimeoutConfig {
            duration_ms: 30_000,
        }),
    }
}

/// Internal gRPC services
///
/// - No rate limit (capacity is managed server-side)
/// - Circuit breaker: 5 failures, 30s cooldown, 2 probes
/// - Retry: 3 attempts, short backoff
/// - Timeout: 10s
pub fn internal_grpc_config() -> ResilienceConfig {
    ResilienceConfig {
        retry: Some(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter_factor: 0.25,
        }),
        circuit_breaker: Some(CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_ms: 30_000,
            half_open_max_requests: 2,
        }),
        rate_limit: None,
        timeout: Some(TimeoutConfig { duration_ms: 10_000 }),
    }
}

/// Third-party search / data APIs with strict quotas
///
/// - Rate limit: 30 req/min
/// - Circuit breaker: 5 failures, 120s cooldown
/// - Retry: 3 attempts
/// - Timeout: 15s
pub fn search_api_config() -> ResilienceConfig {
    ResilienceConfig {
        retry: Some(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.25,
        }),
        circuit_breaker: Some(CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            open_duration_ms: 120_000,
            half_open_max_requests: 1,
        }),
        rate_limit: Some(RateLimitConfig {
            requests_per_minute: 30,
            cost_per_minute: None,
        }),
        timeout: Some(TimeoutConfig {
            duration_ms: 15_000,
        }),
    }
}

/// Outbound webhook delivery
///
/// - Rate limit: 600 req/min
/// - Circuit breaker: 10 failures, 5min cooldown (receivers go down for a while)
/// - Retry: 5 attempts with long backoff
/// - No overall timeout (each attempt is bounded by the HTTP client)
pub fn webhook_delivery_config() -> ResilienceConfig {
    ResilienceConfig {
        retry: Some(RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 3.0,
            jitter_factor: 0.5,
        }),
        circuit_breaker: Some(CircuitBreakerConfig {
            failure_threshold: 10,
            success_threshold: 2,
            open_duration_ms: 300_000,
            half_open_max_requests: 1,
        }),
        rate_limit: Some(RateLimitConfig {
            requests_per_minute: 600,
            cost_per_minute: None,
        }),
        timeout: None,
    }
}
