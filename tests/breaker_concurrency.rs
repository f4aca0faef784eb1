mod common;

use common::{harness_with, ScriptedEngine, TEST_USER};
use pqc_hybrid_auth::{
    AuthRequest, BreakerSettings, CircuitBreakerRegistry, CircuitState, OperationKind, UsedMode,
    UserContext,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_failures_are_all_counted() {
    let h = Arc::new(harness_with(ScriptedEngine::timing_out(), |b| {
        b.breaker(BreakerSettings {
            failure_threshold: 1000,
            cool_down: Duration::from_secs(60),
        })
    }));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let h = h.clone();
            tokio::spawn(async move {
                h.orchestrator
                    .execute(AuthRequest::new(
                        OperationKind::Signing,
                        UserContext::new(TEST_USER),
                    ))
                    .await
            })
        })
        .collect();
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.used_mode, UsedMode::Classical);
    }

    let snapshot = h.orchestrator.breakers().snapshot(OperationKind::Signing);
    assert_eq!(snapshot.consecutive_failures, 50);
    assert_eq!(snapshot.total_failures, 50);
    assert_eq!(h.engine.calls(), 50);
    assert_eq!(h.events().await.len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_outcomes_are_never_lost() {
    let registry = Arc::new(CircuitBreakerRegistry::new(BreakerSettings {
        failure_threshold: 10_000,
        cool_down: Duration::from_secs(60),
    }));

    let tasks: Vec<_> = (0..200)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                if i % 20 == 0 {
                    registry.record_success(OperationKind::Handshake);
                } else {
                    registry.record_failure(OperationKind::Handshake);
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let snapshot = registry.snapshot(OperationKind::Handshake);
    assert_eq!(snapshot.total_successes, 10);
    assert_eq!(snapshot.total_failures, 190);
    assert!(snapshot.consecutive_failures <= 190);

    // A success after the storm always lands
    registry.record_success(OperationKind::Handshake);
    assert_eq!(
        registry.snapshot(OperationKind::Handshake).consecutive_failures,
        0
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_half_open_admits_exactly_one_trial() {
    let registry = Arc::new(CircuitBreakerRegistry::new(BreakerSettings {
        failure_threshold: 1,
        cool_down: Duration::from_millis(200),
    }));
    registry.record_failure(OperationKind::KeyGeneration);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.try_acquire(OperationKind::KeyGeneration) })
        })
        .collect();
    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(
        registry.snapshot(OperationKind::KeyGeneration).state,
        CircuitState::HalfOpen
    );
}
