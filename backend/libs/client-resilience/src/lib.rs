//! Resilience kernel for outbound API clients
//!
//! Wraps calls to rate-limited, occasionally failing dependencies
//! (LLM providers, payment gateways, internal gRPC services):
//! - **Retry**: exponential backoff with jitter, honouring server wait hints
//! - **Circuit Breaker**: fails fast while a dependency is unhealthy
//! - **Rate Limiter**: FIFO admission under a per-minute request/cost budget
//! - **Orchestrator**: composes the three in a fixed order behind one call
//! - **Tower Layer**: the orchestrator as middleware for Tower services
//! - **Preset Configurations**: pre-tuned settings for common dependency types
//!
//! What counts as retryable is always decided by the caller through an
//! [`ErrorClassifier`].
//!
//! # Example: LLM client
//!
//! ```rust,no_run
//! use client_resilience::{presets, ResilienceOrchestrator, RetryAll};
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator =
//!         ResilienceOrchestrator::from_config("llm", &presets::llm_api_config(), RetryAll)
//!             .expect("valid preset");
//!
//!     // Charge the prompt's estimated token count against the budget
//!     let result = orchestrator
//!         .execute_with_cost(|| async {
//!             // Your completion request here
//!             Ok::<_, String>("completion")
//!         }, 1_200)
//!         .await;
//! }
//! ```
//!
//! # Example: gRPC call with the status classifier
//!
//! ```rust,no_run
//! use client_resilience::{presets, GrpcStatusClassifier, ResilienceOrchestrator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let orchestrator = ResilienceOrchestrator::from_config(
//!         "user-service",
//!         &presets::internal_grpc_config(),
//!         GrpcStatusClassifier::default(),
//!     )
//!     .expect("valid preset");
//!
//!     let result = orchestrator
//!         .execute(|| async {
//!             // Your gRPC call here
//!             Ok::<_, tonic::Status>(())
//!         })
//!         .await;
//! }
//! ```

pub mod circuit_breaker;
pub mod classifier;
pub mod error;
pub mod layer;
pub mod metrics;
pub mod orchestrator;
pub mod presets;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitMetrics,
    CircuitOpen, CircuitState,
};
pub use classifier::{
    classify_fn, ErrorClass, ErrorClassifier, FnClassifier, GrpcStatusClassifier, HttpFailure,
    HttpStatusClassifier, NeverRetry, RetryAfterUnit, RetryAll, Retryable, SelfClassified,
};
pub use error::{ConfigError, FailureKind, ResilienceError};
pub use layer::{ResilienceLayer, ResilienceService};
pub use orchestrator::ResilienceOrchestrator;
pub use presets::{
    internal_grpc_config, llm_api_config, payment_api_config, search_api_config,
    webhook_delivery_config, ResilienceConfig,
};
pub use rate_limiter::{AcquireError, RateLimitConfig, RateLimitSnapshot, RateLimiter};
pub use retry::{RetryConfig, RetryExecutor};
pub use timeout::{with_timeout, TimeoutConfig};
pub use tokio_util::sync::CancellationToken;
