use backend_orchestrator::events::{BackendEvent, RejectionReason};
use backend_orchestrator::resilience::{
    fallback_fn, CircuitBreakerConfig, CircuitBreakerCoordinator, CircuitState, RateLimitConfig,
    RateLimitDecision, RateLimiter,
};
use backend_orchestrator::Error;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn fail(breaker: &CircuitBreakerCoordinator, service: &str) -> Error {
    breaker
        .execute::<u32, _, _>(service, "call", || async { Err(Error::transient("boom")) }, None)
        .await
        .unwrap_err()
}

#[tokio::test]
async fn test_three_failures_trip_and_fallback_runs() {
    let breaker = CircuitBreakerCoordinator::default();
    breaker
        .configure("payments", CircuitBreakerConfig::new().with_failure_threshold(3))
        .unwrap();

    for i in 0..3 {
        assert!(matches!(fail(&breaker, "payments").await, Error::Transient { .. }));
        let expected = if i < 2 { CircuitState::Closed } else { CircuitState::Open };
        assert_eq!(breaker.state("payments"), Some(expected));
    }

    // Fourth call: rejected without running the wrapped function.
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);
    let err = breaker
        .execute::<u32, _, _>(
            "payments",
            "call",
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }));
    assert!(err.is_policy_rejection());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    let seen_args = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen_args);
    breaker.register_fallback(
        "payments",
        fallback_fn(move |args| {
            *sink.lock().unwrap() = args.clone();
            async move { Ok(json!({ "cached": true })) }
        }),
    );
    let value: serde_json::Value = breaker
        .execute(
            "payments",
            "call",
            || async { Ok(json!({ "cached": false })) },
            Some(json!({ "order": 7 })),
        )
        .await
        .unwrap();
    assert_eq!(value, json!({ "cached": true }));
    assert_eq!(*seen_args.lock().unwrap(), Some(json!({ "order": 7 })));

    let stats = breaker.snapshot("payments").unwrap().stats;
    assert_eq!(stats.failed_calls, 3);
    assert_eq!(stats.rejected_calls, 2);
    assert_eq!(stats.fallback_calls, 1);
}

#[tokio::test]
async fn test_success_resets_consecutive_failures() {
    let breaker = CircuitBreakerCoordinator::new(CircuitBreakerConfig::new().with_failure_threshold(3));
    fail(&breaker, "svc").await;
    fail(&breaker, "svc").await;
    let _: u32 = breaker
        .execute("svc", "call", || async { Ok(1) }, None)
        .await
        .unwrap();
    fail(&breaker, "svc").await;
    fail(&breaker, "svc").await;
    assert_eq!(breaker.state("svc"), Some(CircuitState::Closed));
    fail(&breaker, "svc").await;
    assert_eq!(breaker.state("svc"), Some(CircuitState::Open));
}

#[tokio::test]
async fn test_recovery_through_half_open() {
    let breaker = CircuitBreakerCoordinator::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_success_threshold(2)
            .with_reset_timeout(Duration::from_millis(40)),
    );
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    let _sub = breaker
        .subscribe(move |e| {
            if let BackendEvent::StateChange { from, to, .. } = e {
                sink.lock().unwrap().push((*from, *to));
            }
        })
        .unwrap();

    fail(&breaker, "db").await;
    assert_eq!(breaker.state("db"), Some(CircuitState::Open));
    tokio::time::sleep(Duration::from_millis(60)).await;

    // No timer moves the circuit; the next call does.
    assert_eq!(breaker.state("db"), Some(CircuitState::Open));
    let _: u32 = breaker.execute("db", "q", || async { Ok(1) }, None).await.unwrap();
    assert_eq!(breaker.state("db"), Some(CircuitState::HalfOpen));
    let _: u32 = breaker.execute("db", "q", || async { Ok(2) }, None).await.unwrap();
    assert_eq!(breaker.state("db"), Some(CircuitState::Closed));

    assert_eq!(
        *transitions.lock().unwrap(),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let breaker = CircuitBreakerCoordinator::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_reset_timeout(Duration::from_millis(30)),
    );
    fail(&breaker, "cache").await;
    fail(&breaker, "cache").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    fail(&breaker, "cache").await;
    assert_eq!(breaker.state("cache"), Some(CircuitState::Open));
}

#[tokio::test]
async fn test_timeout_counts_as_failure() {
    let breaker = CircuitBreakerCoordinator::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(1)
            .with_timeout(Duration::from_millis(20)),
    );
    let err = breaker
        .execute::<u32, _, _>(
            "slow",
            "call",
            || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(1)
            },
            None,
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(err.is_retryable());
    assert_eq!(breaker.state("slow"), Some(CircuitState::Open));
    assert_eq!(breaker.snapshot("slow").unwrap().stats.timeout_calls, 1);
}

#[tokio::test]
async fn test_rejection_event_names_reason() {
    let breaker = CircuitBreakerCoordinator::default();
    breaker.force_open("search");
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    let _sub = breaker
        .subscribe(move |e| {
            if let BackendEvent::CallRejected { reason, fallback_used, .. } = e {
                sink.lock().unwrap().push((*reason, *fallback_used));
            }
        })
        .unwrap();
    let _ = breaker
        .execute::<u32, _, _>("search", "q", || async { Ok(1) }, None)
        .await;
    assert_eq!(
        *reasons.lock().unwrap(),
        vec![(RejectionReason::CircuitOpen, false)]
    );
    breaker.reset("search").unwrap();
    assert_eq!(breaker.state("search"), Some(CircuitState::Closed));
}

#[test]
fn test_bucket_of_two_without_refill() {
    let limiter = RateLimiter::new();
    limiter
        .configure(
            "search",
            RateLimitConfig::new().with_max_tokens(2).with_refill_rate(0.0),
        )
        .unwrap();
    assert!(limiter.try_consume("search", 1).is_allowed());
    assert!(limiter.try_consume("search", 1).is_allowed());
    match limiter.try_consume("search", 1) {
        RateLimitDecision::Denied { retry_after } => assert!(retry_after.is_none()),
        other => panic!("expected denial, got {:?}", other),
    }
    let snap = limiter.snapshot("search").unwrap();
    assert_eq!(snap.total_requests, 3);
    assert_eq!(snap.allowed_requests, 2);
}

#[tokio::test]
async fn test_acquire_waits_for_refill() {
    let limiter = RateLimiter::new();
    limiter
        .configure(
            "api",
            RateLimitConfig::new().with_max_tokens(1).with_refill_rate(50.0),
        )
        .unwrap();
    assert!(limiter.try_consume("api", 1).is_allowed());
    limiter
        .acquire("api", 1, Duration::from_millis(500))
        .await
        .unwrap();

    let frozen = RateLimiter::new();
    frozen
        .configure(
            "api",
            RateLimitConfig::new().with_max_tokens(1).with_refill_rate(0.0),
        )
        .unwrap();
    assert!(frozen.try_consume("api", 1).is_allowed());
    let err = frozen
        .acquire("api", 1, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));
}
