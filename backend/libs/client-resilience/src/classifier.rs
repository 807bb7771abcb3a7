//! Error classification seam
//!
//! The kernel never decides on its own what "retryable" means. Every client
//! hands it an [`ErrorClassifier`] for its error type: a retryability
//! predicate plus an optional explicit wait hint (a `Retry-After` header,
//! a provider cooldown field, ...).

use std::time::Duration;

/// How one failure should be handled by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable, back off normally
    Transient,
    /// Retryable, the dependency told us how long to wait
    RateLimited(Duration),
    /// Not worth retrying (auth, validation, not found)
    Permanent,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Permanent)
    }
}

pub trait ErrorClassifier<E>: Send + Sync {
    fn is_retryable(&self, error: &E) -> bool;

    /// Explicit wait requested by the dependency. `None` means "compute
    /// backoff normally", never "don't retry".
    fn retry_after(&self, _error: &E) -> Option<Duration> {
        None
    }

    fn classify(&self, error: &E) -> ErrorClass {
        if !self.is_retryable(error) {
            return ErrorClass::Permanent;
        }
        match self.retry_after(error) {
            Some(wait) => ErrorClass::RateLimited(wait),
            None => ErrorClass::Transient,
        }
    }
}

impl<E, C> ErrorClassifier<E> for std::sync::Arc<C>
where
    C: ErrorClassifier<E> + ?Sized,
{
    fn is_retryable(&self, error: &E) -> bool {
        (**self).is_retryable(error)
    }

    fn retry_after(&self, error: &E) -> Option<Duration> {
        (**self).retry_after(error)
    }
}

/// Treats every error as transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryAll;

impl<E> ErrorClassifier<E> for RetryAll {
    fn is_retryable(&self, _error: &E) -> bool {
        true
    }
}

/// Treats every error as permanent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl<E> ErrorClassifier<E> for NeverRetry {
    fn is_retryable(&self, _error: &E) -> bool {
        false
    }
}

/// Implemented by error types that know whether they are worth retrying.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Delegates to the error's own [`Retryable`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfClassified;

impl<E: Retryable> ErrorClassifier<E> for SelfClassified {
    fn is_retryable(&self, error: &E) -> bool {
        error.is_retryable()
    }

    fn retry_after(&self, error: &E) -> Option<Duration> {
        error.retry_after()
    }
}

/// Classifier built from closures, see [`classify_fn`].
#[derive(Clone)]
pub struct FnClassifier<P, H> {
    predicate: P,
    retry_after: H,
}

impl<P, H> std::fmt::Debug for FnClassifier<P, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnClassifier").finish_non_exhaustive()
    }
}

fn no_hint<E>(_error: &E) -> Option<Duration> {
    None
}

/// Build a classifier from a retryability predicate.
///
/// ```rust
/// use client_resilience::classifier::{classify_fn, ErrorClassifier};
/// use std::time::Duration;
///
/// let classifier = classify_fn(|status: &u16| *status >= 500 || *status == 429)
///     .with_retry_after(|status: &u16| (*status == 429).then(|| Duration::from_secs(2)));
///
/// assert!(classifier.is_retryable(&503));
/// assert_eq!(classifier.retry_after(&429), Some(Duration::from_secs(2)));
/// ```
pub fn classify_fn<E, P>(predicate: P) -> FnClassifier<P, fn(&E) -> Option<Duration>>
where
    P: Fn(&E) -> bool + Send + Sync,
{
    FnClassifier {
        predicate,
        retry_after: no_hint::<E>,
    }
}

impl<P, H> FnClassifier<P, H> {
    pub fn with_retry_after<E, H2>(self, retry_after: H2) -> FnClassifier<P, H2>
    where
        H2: Fn(&E) -> Option<Duration> + Send + Sync,
    {
        FnClassifier {
            predicate: self.predicate,
            retry_after,
        }
    }
}

impl<E, P, H> ErrorClassifier<E> for FnClassifier<P, H>
where
    P: Fn(&E) -> bool + Send + Sync,
    H: Fn(&E) -> Option<Duration> + Send + Sync,
{
    fn is_retryable(&self, error: &E) -> bool {
        (self.predicate)(error)
    }

    fn retry_after(&self, error: &E) -> Option<Duration> {
        (self.retry_after)(error)
    }
}

/// Unit a provider uses for its retry-after values.
///
/// Providers disagree: most send whole seconds, some send milliseconds.
/// Every call site declares which one it gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryAfterUnit {
    #[default]
    Seconds,
    Millis,
}

impl RetryAfterUnit {
    /// Parse a numeric retry-after value. HTTP dates and garbage yield `None`,
    /// which falls back to computed backoff.
    pub fn parse(&self, raw: &str) -> Option<Duration> {
        let value: f64 = raw.trim().parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let nanos_per_unit = match self {
            RetryAfterUnit::Seconds => 1_000_000_000.0,
            RetryAfterUnit::Millis => 1_000_000.0,
        };
        Some(Duration::from_nanos((value * nanos_per_unit).round() as u64))
    }
}

/// View of an HTTP client error, implemented by each provider's error type.
pub trait HttpFailure {
    /// Response status, or `None` when no response arrived (connect error,
    /// reset, read timeout).
    fn status(&self) -> Option<u16>;

    /// Raw `Retry-After` header value, if the response carried one.
    fn retry_after_header(&self) -> Option<&str> {
        None
    }
}

/// Classifies HTTP failures by status code.
///
/// Retryable:
/// - no response at all (network errors)
/// - 408 Request Timeout, 425 Too Early, 429 Too Many Requests
/// - 500, 502, 503, 504
///
/// Everything else (400, 401, 403, 404, 422, ...) is permanent.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpStatusClassifier {
    retry_after_unit: RetryAfterUnit,
}

impl HttpStatusClassifier {
    pub fn new(retry_after_unit: RetryAfterUnit) -> Self {
        Self { retry_after_unit }
    }

    pub fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
    }
}

impl<E: HttpFailure> ErrorClassifier<E> for HttpStatusClassifier {
    fn is_retryable(&self, error: &E) -> bool {
        error.status().map_or(true, Self::is_retryable_status)
    }

    fn retry_after(&self, error: &E) -> Option<Duration> {
        error
            .retry_after_header()
            .and_then(|raw| self.retry_after_unit.parse(raw))
    }
}

/// Classifies `tonic::Status` errors by gRPC code.
///
/// Retryable:
/// - Unavailable (service down, temporary network issue)
/// - DeadlineExceeded (timeout)
/// - ResourceExhausted (rate limit, may recover)
/// - Aborted (concurrency conflict)
/// - Unknown (network errors often map to Unknown)
///
/// A `retry-after` metadata entry is honoured as the wait hint.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcStatusClassifier {
    retry_after_unit: RetryAfterUnit,
}

impl GrpcStatusClassifier {
    pub fn new(retry_after_unit: RetryAfterUnit) -> Self {
        Self { retry_after_unit }
    }
}

impl ErrorClassifier<tonic::Status> for GrpcStatusClassifier {
    fn is_retryable(&self, error: &tonic::Status) -> bool {
        matches!(
            error.code(),
            tonic::Code::Unavailable
                | tonic::Code::DeadlineExceeded
                | tonic::Code::ResourceExhausted
                | tonic::Code::Aborted
                | tonic::Code::Unknown
        )
    }

    fn retry_after(&self, error: &tonic::Status) -> Option<Duration> {
        let raw = error.metadata().get("retry-after")?.to_str().ok()?;
        self.retry_after_unit.parse(raw)
    }
}
