/// Integration tests for the resilience kernel
use client_resilience::{
    classify_fn, presets, CancellationToken, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitState, GrpcStatusClassifier, RateLimitConfig, RateLimiter,
    ResilienceConfig, ResilienceError, ResilienceLayer, ResilienceOrchestrator, RetryAll,
    RetryConfig, RetryExecutor,
};
use futures_util::future::join_all;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service, ServiceExt};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fixed_retry(max_attempts: u32, initial_delay_ms: u64) -> RetryExecutor {
    RetryExecutor::new(RetryConfig {
        max_attempts,
        initial_delay_ms,
        max_delay_ms: 60_000,
        multiplier: 2.0,
        jitter_factor: 0.0,
    })
}

// ==================== Circuit Breaker Tests ====================

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_full_lifecycle() {
    init_tracing();
    let cb = CircuitBreaker::new(
        "lifecycle",
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_duration_ms: 100,
            half_open_max_requests: 1,
        },
    );

    // Phase 1: Closed -> Open (3 failures)
    for _ in 0..3 {
        let _ = cb.execute(|| async { Err::<(), _>("error") }).await;
    }
    assert_eq!(cb.state(), CircuitState::Open);

    // Phase 2: Open -> HalfOpen (wait for open duration)
    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    // Phase 3: HalfOpen -> Closed (2 successes)
    let _ = cb.execute(|| async { Ok::<_, String>(()) }).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    let _ = cb.execute(|| async { Ok::<_, String>(()) }).await;
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.metrics().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_consecutive_failures() {
    let cb = CircuitBreaker::new("consecutive", CircuitBreakerConfig::default());

    for _ in 0..4 {
        let _ = cb.execute(|| async { Err::<(), _>("error") }).await;
    }
    let _ = cb.execute(|| async { Ok::<_, String>(()) }).await;
    assert_eq!(cb.metrics().failure_count, 0);

    for _ in 0..4 {
        let _ = cb.execute(|| async { Err::<(), _>("error") }).await;
    }
    assert_eq!(cb.state(), CircuitState::Closed);

    let _ = cb.execute(|| async { Err::<(), _>("error") }).await;
    assert_eq!(cb.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_only_orchestrator_matches_bare_breaker() {
    let config = CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 1,
        open_duration_ms: 1_000,
        half_open_max_requests: 1,
    };
    let bare = CircuitBreaker::new("bare", config.clone());
    let orchestrator = ResilienceOrchestrator::new("wrapped", RetryAll)
        .with_circuit_breaker(CircuitBreaker::new("wrapped", config));
    let wrapped = orchestrator.circuit_breaker().unwrap().clone();

    let outcomes = [false, true, false, false, false, true];
    for ok in outcomes {
        let bare_result = bare
            .execute(|| async move { if ok { Ok(()) } else { Err("503") } })
            .await;
        let wrapped_result = orchestrator
            .execute(|| async move { if ok { Ok(()) } else { Err("503") } })
            .await;

        assert_eq!(bare_result.is_ok(), wrapped_result.is_ok());
        assert_eq!(bare.metrics().state, wrapped.metrics().state);
        assert_eq!(bare.metrics().failure_count, wrapped.metrics().failure_count);
    }
    assert_eq!(wrapped.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1_000)).await;
    let _ = bare.execute(|| async { Ok::<_, &str>(()) }).await;
    let _ = orchestrator.execute(|| async { Ok::<_, &str>(()) }).await;
    assert_eq!(bare.state(), CircuitState::Closed);
    assert_eq!(wrapped.state(), CircuitState::Closed);
}

// ==================== Parallel Callers ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_failures_are_each_counted_once() {
    let cb = CircuitBreaker::new(
        "parallel",
        CircuitBreakerConfig {
            failure_threshold: 10_000,
            ..Default::default()
        },
    );

    let handles = (0..999).map(|_| {
        let cb = cb.clone();
        tokio::spawn(async move {
            cb.execute(|| async {
                tokio::task::yield_now().await;
                Err::<(), _>("503")
            })
            .await
        })
    });
    let results = join_all(handles).await;

    assert!(results.into_iter().all(|joined| matches!(
        joined.unwrap(),
        Err(CircuitBreakerError::CallFailed("503"))
    )));
    let metrics = cb.metrics();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.failure_count, 999);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_failures_trip_breaker_consistently() {
    let cb = CircuitBreaker::new(
        "parallel-open",
        CircuitBreakerConfig {
            failure_threshold: 50,
            open_duration_ms: 60_000,
            ..Default::default()
        },
    );
    let invoked = Arc::new(AtomicU32::new(0));

    let handles = (0..400).map(|_| {
        let cb = cb.clone();
        let invoked = invoked.clone();
        tokio::spawn(async move {
            cb.execute(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("503") }
            })
            .await
        })
    });
    let rejected = join_all(handles)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Err(CircuitBreakerError::Open(_)))))
        .count();

    // Every call either ran or was rejected, never both. Failures landing
    // after the trip are stale and leave the fresh Open counters alone.
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(invoked.load(Ordering::SeqCst) as usize + rejected, 400);
    assert!(invoked.load(Ordering::SeqCst) >= 50);
    assert_eq!(cb.metrics().failure_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_acquires_never_exceed_budget() {
    let limiter = RateLimiter::new(
        "parallel",
        RateLimitConfig {
            requests_per_minute: 10_000,
            cost_per_minute: Some(1_000),
        },
    );

    // Over budget callers queue for a minute; give up well before that
    let handles = (0..300).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            tokio::time::timeout(Duration::from_secs(2), limiter.acquire(7))
                .await
                .is_ok()
        })
    });
    let admitted = join_all(handles)
        .await
        .into_iter()
        .filter(|joined| *joined.as_ref().unwrap())
        .count();

    // 142 * 7 = 994, one more would be 1001
    assert_eq!(admitted, 142);
    let snapshot = limiter.available();
    assert_eq!(snapshot.cost_remaining, Some(6));
    assert_eq!(snapshot.requests_remaining, 10_000 - 142);
}

// ==================== Rate Limiter Tests ====================

#[tokio::test(start_paused = true)]
async fn test_rate_limit_holds_over_any_rolling_minute() {
    init_tracing();
    let limiter = RateLimiter::new(
        "rolling",
        RateLimitConfig {
            requests_per_minute: 60,
            cost_per_minute: None,
        },
    );
    let start = Instant::now();

    let handles = (0..150).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter.acquire(1).await.unwrap();
            Instant::now()
        })
    });
    let mut admitted: Vec<Instant> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();
    admitted.sort();

    for (i, at) in admitted.iter().enumerate() {
        let in_window = admitted[i..]
            .iter()
            .take_while(|later| later.duration_since(*at) < Duration::from_secs(60))
            .count();
        assert!(in_window <= 60, "{in_window} admissions within a minute");
    }

    // 60 now, 60 a minute later, the rest a minute after that
    assert_eq!(admitted[59] - start, Duration::ZERO);
    assert_eq!(admitted[60] - start, Duration::from_secs(60));
    assert_eq!(admitted[149] - start, Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn test_large_waiter_is_not_starved_by_small_ones() {
    let limiter = RateLimiter::new(
        "tokens",
        RateLimitConfig {
            requests_per_minute: 100,
            cost_per_minute: Some(1_000),
        },
    );
    limiter.acquire(900).await.unwrap();
    let start = Instant::now();
    let order = Arc::new(Mutex::new(Vec::new()));

    let big = {
        let limiter = limiter.clone();
        let order = order.clone();
        tokio::spawn(async move {
            limiter.acquire(500).await.unwrap();
            order.lock().unwrap().push(("big", start.elapsed()));
        })
    };
    tokio::task::yield_now().await;

    let small: Vec<_> = (0..3)
        .map(|_| {
            let limiter = limiter.clone();
            let order = order.clone();
            tokio::spawn(async move {
                limiter.acquire(50).await.unwrap();
                order.lock().unwrap().push(("small", start.elapsed()));
            })
        })
        .collect();

    big.await.unwrap();
    for handle in small {
        handle.await.unwrap();
    }

    let order = order.lock().unwrap();
    assert_eq!(order[0], ("big", Duration::from_secs(60)));
    assert!(order[1..]
        .iter()
        .all(|entry| *entry == ("small", Duration::from_secs(60))));
}

#[tokio::test(start_paused = true)]
async fn test_reset_wakes_waiting_caller() {
    let limiter = RateLimiter::new(
        "reset",
        RateLimitConfig {
            requests_per_minute: 1,
            cost_per_minute: None,
        },
    );
    limiter.acquire(1).await.unwrap();

    let waiter = {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            limiter.acquire(1).await.unwrap();
            start.elapsed()
        })
    };
    tokio::time::sleep(Duration::from_secs(10)).await;
    limiter.reset();

    let waited = waiter.await.unwrap();
    assert_eq!(waited, Duration::from_secs(10));
}

// ==================== Orchestrator Tests ====================

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_overrides_backoff() {
    let classifier = classify_fn(|e: &&str| *e != "400")
        .with_retry_after(|e: &&str| (*e == "429").then(|| Duration::from_secs(5)));
    let orchestrator =
        ResilienceOrchestrator::new("hinted", classifier).with_retry(fixed_retry(3, 100));

    let attempts_at = Mutex::new(Vec::new());
    let start = Instant::now();
    let result = orchestrator
        .execute(|| {
            let mut attempts = attempts_at.lock().unwrap();
            attempts.push(start.elapsed());
            let n = attempts.len();
            async move {
                match n {
                    1 => Err("429"),
                    2 => Err("503"),
                    _ => Ok("done"),
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    // 5s from the hint, then normal backoff for attempt 2 (200ms)
    assert_eq!(
        *attempts_at.lock().unwrap(),
        vec![
            Duration::ZERO,
            Duration::from_secs(5),
            Duration::from_millis(5_200)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_while_waiting_for_budget() {
    let limiter = RateLimiter::new(
        "cancel",
        RateLimitConfig {
            requests_per_minute: 1,
            cost_per_minute: None,
        },
    );
    let orchestrator = ResilienceOrchestrator::new("cancel", RetryAll)
        .with_retry(fixed_retry(3, 100))
        .with_circuit_breaker(CircuitBreaker::new("cancel", CircuitBreakerConfig::default()))
        .with_rate_limiter(limiter.clone());
    limiter.acquire(1).await.unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        canceller.cancel();
    });

    let calls = AtomicU32::new(0);
    let start = Instant::now();
    let result = orchestrator
        .execute_cancellable(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(()) }
            },
            1,
            &token,
        )
        .await;

    assert!(matches!(result, Err(ResilienceError::Cancelled)));
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The cancelled caller took nothing from the budget
    tokio::time::advance(Duration::from_secs(55)).await;
    assert_eq!(limiter.available().requests_remaining, 1);
    assert_eq!(
        orchestrator.circuit_breaker().unwrap().metrics().failure_count,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_running_attempt() {
    let orchestrator = ResilienceOrchestrator::new("slow", RetryAll)
        .with_retry(fixed_retry(3, 100))
        .with_circuit_breaker(CircuitBreaker::new(
            "slow",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        ));
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let result = orchestrator
        .execute_cancellable(
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, &str>(())
            },
            1,
            &token,
        )
        .await;

    assert!(matches!(result, Err(ResilienceError::Cancelled)));
    assert_eq!(
        orchestrator.circuit_breaker().unwrap().state(),
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn test_orchestrator_reset_restores_service() {
    let orchestrator = ResilienceOrchestrator::new("reset", RetryAll)
        .with_circuit_breaker(CircuitBreaker::new(
            "reset",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        ))
        .with_rate_limiter(RateLimiter::new(
            "reset",
            RateLimitConfig {
                requests_per_minute: 2,
                cost_per_minute: None,
            },
        ));

    let _ = orchestrator.execute(|| async { Err::<(), _>("503") }).await;
    let rejected = orchestrator.execute(|| async { Ok::<_, &str>(()) }).await;
    assert!(rejected.unwrap_err().is_circuit_open());

    orchestrator.reset();

    let start = Instant::now();
    let result = orchestrator.execute(|| async { Ok::<_, &str>("back") }).await;
    assert_eq!(result.unwrap(), "back");
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_grpc_classifier_through_orchestrator() {
    let orchestrator = ResilienceOrchestrator::new("grpc", GrpcStatusClassifier::default())
        .with_retry(fixed_retry(3, 100));

    // Unavailable is retried with a server-provided wait
    let calls = AtomicU32::new(0);
    let start = Instant::now();
    let result = orchestrator
        .execute(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    let mut status = tonic::Status::unavailable("draining");
                    status
                        .metadata_mut()
                        .insert("retry-after", "2".parse().unwrap());
                    Err(status)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
    assert_eq!(result.unwrap(), 1);
    assert_eq!(start.elapsed(), Duration::from_secs(2));

    // PermissionDenied is permanent
    let calls = AtomicU32::new(0);
    let result = orchestrator
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(tonic::Status::permission_denied("no")) }
        })
        .await;
    match result {
        Err(ResilienceError::Permanent { error, attempts }) => {
            assert_eq!(error.code(), tonic::Code::PermissionDenied);
            assert_eq!(attempts, 1);
        }
        other => panic!("expected permanent failure, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ==================== Configuration Tests ====================

#[tokio::test(start_paused = true)]
async fn test_orchestrator_from_json_config() {
    let config: ResilienceConfig = serde_json::from_str(
        r#"{
            "retry": { "max_attempts": 2, "initial_delay_ms": 250, "jitter_factor": 0.0 },
            "circuit_breaker": { "failure_threshold": 2 },
            "rate_limit": { "requests_per_minute": 10 },
            "timeout": { "duration_ms": 5000 }
        }"#,
    )
    .unwrap();
    let orchestrator = ResilienceOrchestrator::from_config("json", &config, RetryAll).unwrap();

    let calls = AtomicU32::new(0);
    let start = Instant::now();
    let result = orchestrator
        .execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("503") }
        })
        .await;

    assert!(matches!(
        result,
        Err(ResilienceError::Exhausted { attempts: 2, .. })
    ));
    assert_eq!(start.elapsed(), Duration::from_millis(250));
    assert_eq!(
        orchestrator.rate_limiter().unwrap().available().requests_remaining,
        9
    );
    assert_eq!(
        orchestrator.circuit_breaker().unwrap().metrics().failure_count,
        1
    );
}

#[test]
fn test_presets_build_orchestrators() {
    for (name, config) in [
        ("llm", presets::llm_api_config()),
        ("payment", presets::payment_api_config()),
        ("grpc", presets::internal_grpc_config()),
        ("search", presets::search_api_config()),
        ("webhook", presets::webhook_delivery_config()),
    ] {
        let orchestrator = ResilienceOrchestrator::from_config(name, &config, RetryAll).unwrap();
        assert_eq!(orchestrator.name(), name);
        assert_eq!(
            orchestrator.rate_limiter().is_some(),
            config.rate_limit.is_some()
        );
    }
}

// ==================== Tower Layer Tests ====================

#[tokio::test(start_paused = true)]
async fn test_layer_wraps_service_fn() {
    let calls = Arc::new(AtomicU32::new(0));
    let inner = {
        let calls = calls.clone();
        tower::service_fn(move |req: u32| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("503")
                } else {
                    Ok(req * 2)
                }
            }
        })
    };

    let orchestrator = ResilienceOrchestrator::new("tower", RetryAll).with_retry(fixed_retry(2, 50));
    let mut service = ResilienceLayer::new(orchestrator).layer(inner);

    let response = service.ready().await.unwrap().call(21).await.unwrap();
    assert_eq!(response, 42);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
