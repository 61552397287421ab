//! Admission gated by circuit breakers on external dependencies.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use foreman::core::{Batch, TaskId, TaskStatus};
use foreman::orchestration::{BreakerState, FnProbe, HealthMonitor};

use crate::fixtures::{task, Harness};

/// Monitor with a closure probe for `api` whose breaker starts open.
async fn opened_monitor(
    harness: &Harness,
    healthy: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
) -> Arc<HealthMonitor> {
    let mut monitor = HealthMonitor::new(harness.config.health.clone());
    monitor.register(Arc::new(FnProbe::new("api", move || {
        probes.fetch_add(1, Ordering::SeqCst);
        healthy.load(Ordering::SeqCst)
    })));
    for _ in 0..harness.config.health.failure_threshold {
        monitor.record_failure("api", "connection refused").await;
    }
    assert_eq!(monitor.state("api").await, BreakerState::Open);
    Arc::new(monitor)
}

#[tokio::test]
async fn test_unhealthy_dependency_defers_until_probe_succeeds() {
    let harness = Harness::new();
    let healthy = Arc::new(AtomicBool::new(true));
    let probes = Arc::new(AtomicUsize::new(0));
    let monitor = opened_monitor(&harness, healthy, probes.clone()).await;
    let batch = Batch::new(vec![task("needs-api").requiring("api"), task("offline")]);

    let started = Instant::now();
    let report = harness
        .coordinator()
        .with_health(monitor.clone())
        .run(&batch, CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(report.succeeded());
    // Admission waited out the one-second cooldown before the half-open probe.
    assert!(elapsed >= Duration::from_millis(900), "ran after {:?}", elapsed);
    assert!(probes.load(Ordering::SeqCst) >= 1);
    assert_eq!(monitor.state("api").await, BreakerState::Closed);
    // Tasks without the dependency were never held back.
    assert_eq!(
        harness.driver.start_order()[0],
        TaskId::from("offline")
    );
}

#[tokio::test]
async fn test_failed_probe_reopens_and_defers_again() {
    let harness = Harness::new();
    let healthy = Arc::new(AtomicBool::new(false));
    let probes = Arc::new(AtomicUsize::new(0));
    let monitor = opened_monitor(&harness, healthy.clone(), probes.clone()).await;
    let batch = Batch::new(vec![task("needs-api").requiring("api")]);

    let recover = healthy.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        recover.store(true, Ordering::SeqCst);
    });

    let started = Instant::now();
    let report = harness
        .coordinator()
        .with_health(monitor.clone())
        .run(&batch, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.get(&TaskId::from("needs-api")).unwrap().status,
        TaskStatus::Completed
    );
    // First probe at ~1s fails and re-opens; the second at ~2s succeeds.
    assert!(probes.load(Ordering::SeqCst) >= 2);
    assert!(started.elapsed() >= Duration::from_millis(1900));
    assert_eq!(monitor.state("api").await, BreakerState::Closed);
}

#[tokio::test]
async fn test_cancel_while_deferred_abandons_task() {
    let harness = Harness::new();
    let monitor = opened_monitor(
        &harness,
        Arc::new(AtomicBool::new(false)),
        Arc::new(AtomicUsize::new(0)),
    )
    .await;
    let batch = Batch::new(vec![task("needs-api").requiring("api")]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let report = harness
        .coordinator()
        .with_health(monitor)
        .run(&batch, cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(
        report.get(&TaskId::from("needs-api")).unwrap().status,
        TaskStatus::Abandoned
    );
    assert!(harness.driver.phases_run("needs-api").is_empty());
}
