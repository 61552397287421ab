//! Checkpoint resume, cancellation and workspace hygiene.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use foreman::checkpoint::{Checkpoint, CheckpointStore};
use foreman::core::{Batch, TaskId, TaskStatus};
use foreman::workflow::{Phase, PhaseRecord};
use foreman::ErrorKind;

use crate::fixtures::{task, test_config, Behavior, Harness};

/// A checkpoint with every phase up to `last` completed, claiming the given
/// artifacts for each.
fn checkpoint_through(id: &str, last: Phase, artifacts: &[&str]) -> Checkpoint {
    let history = Phase::ALL
        .iter()
        .filter(|p| **p <= last)
        .map(|phase| {
            let mut record = PhaseRecord::new(TaskId::from(id), *phase);
            record.start();
            record.complete(artifacts.iter().map(|a| a.to_string()).collect());
            record
        })
        .collect();
    Checkpoint::new(TaskId::from(id), history, 1)
}

#[tokio::test]
async fn test_resume_continues_after_last_verified_phase() {
    let harness = Harness::new();
    harness
        .store
        .save(&checkpoint_through("resumed", Phase::Planning, &[]))
        .await
        .unwrap();

    let report = harness.run(&Batch::new(vec![task("resumed")])).await;

    let resumed = report.get(&TaskId::from("resumed")).unwrap();
    assert_eq!(resumed.status, TaskStatus::Completed);
    assert_eq!(
        harness.driver.phases_run("resumed"),
        vec![
            Phase::Implementation,
            Phase::Verification,
            Phase::Integration,
            Phase::Finalization
        ]
    );
    // The report carries the restored history too.
    assert_eq!(resumed.phases.len(), Phase::ALL.len());
    // Completion discards the checkpoint.
    assert!(harness
        .store
        .load(&TaskId::from("resumed"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_resume_reexecutes_phase_that_no_longer_verifies() {
    let harness = Harness::new();
    // The artifact lived in a workspace that no longer exists.
    harness
        .store
        .save(&checkpoint_through("stale", Phase::Planning, &["gone.txt"]))
        .await
        .unwrap();

    let report = harness.run(&Batch::new(vec![task("stale")])).await;

    assert_eq!(
        report.get(&TaskId::from("stale")).unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(
        harness.driver.phases_run("stale").first(),
        Some(&Phase::Planning)
    );
}

#[tokio::test]
async fn test_resuming_completed_task_runs_no_phases() {
    let harness = Harness::new();
    harness
        .store
        .save(&checkpoint_through("done", Phase::Finalization, &[]))
        .await
        .unwrap();

    let report = harness.run(&Batch::new(vec![task("done")])).await;

    assert_eq!(
        report.get(&TaskId::from("done")).unwrap().status,
        TaskStatus::Completed
    );
    assert!(harness.driver.phases_run("done").is_empty());
    // Still integrated exactly once.
    assert_eq!(harness.host.merge_count(), 1);
}

#[tokio::test]
async fn test_cancellation_abandons_at_phase_boundary() {
    let mut config = test_config();
    config.scheduler.max_concurrent = Some(1);
    let harness = Harness::with_config(config, Duration::from_millis(150));
    let batch = Batch::new(vec![task("first"), task("second"), task("third")]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });
    let report = harness
        .coordinator()
        .run(&batch, cancel)
        .await
        .expect("cancelled run still reports");

    assert!(report.cancelled);
    assert_eq!(report.exit_code(), 130);
    assert!(report
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Abandoned));

    // The running task stopped between phases and kept its checkpoint.
    let first = report.get(&TaskId::from("first")).unwrap();
    assert!(first.phase.is_some());
    assert!(first.last_checkpoint.is_some());
    let saved = harness
        .store
        .load(&TaskId::from("first"))
        .await
        .unwrap()
        .expect("checkpoint kept for resume");
    assert_eq!(saved.last_completed, first.last_checkpoint);
    assert!(harness.driver.phases_run("first").len() < Phase::ALL.len());

    // Queued tasks never started and nothing was left on disk.
    assert!(harness.driver.phases_run("second").is_empty());
    assert!(harness.workspace_entries().is_empty());
    assert_eq!(harness.host.merge_count(), 0);
}

#[tokio::test]
async fn test_hard_deadline_fails_phase_that_ignores_cancellation() {
    let harness = Harness::new();
    harness.driver.script(
        "endless",
        Behavior {
            phase_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        },
    );
    let batch = Batch::new(vec![task("endless")]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let report = harness.coordinator().run(&batch, cancel).await.unwrap();
    let elapsed = started.elapsed();

    // Cancelled at 200ms, forced after the one-second grace.
    assert!(elapsed >= Duration::from_millis(1100), "took {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);

    assert!(report.cancelled);
    let endless = report.get(&TaskId::from("endless")).unwrap();
    assert!(matches!(endless.status, TaskStatus::Failed { .. }));
    assert_eq!(endless.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(endless.phase, Some(Phase::Setup));
    assert_eq!(harness.driver.phases_run("endless"), vec![Phase::Setup]);

    assert!(harness.workspace_entries().is_empty());
    assert_eq!(harness.host.branch_count(), 0);
    assert_eq!(harness.host.merge_count(), 0);
}

#[tokio::test]
async fn test_abandoned_task_resumes_in_next_run() {
    let harness = Harness::with_config(test_config(), Duration::from_millis(100));
    let batch = Batch::new(vec![task("long")]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        trigger.cancel();
    });
    let first = harness.coordinator().run(&batch, cancel).await.unwrap();
    let stopped_after = first
        .get(&TaskId::from("long"))
        .and_then(|t| t.last_checkpoint)
        .expect("some phase checkpointed");

    let second = harness.run(&batch).await;

    assert!(second.succeeded());
    let phases = harness.driver.phases_run("long");
    // The last checkpointed phase lost its workspace, so it runs again.
    let reruns = phases.iter().filter(|p| **p == stopped_after).count();
    assert_eq!(reruns, 2);
    assert_eq!(
        phases.iter().filter(|p| **p == Phase::Setup).count(),
        if stopped_after == Phase::Setup { 2 } else { 1 }
    );
}

#[tokio::test]
async fn test_acquire_release_acquire_leaves_nothing_behind() {
    let harness = Harness::new();
    let id = TaskId::from("cycle");

    let mut first = harness.isolation.acquire(&id).await.unwrap();
    assert!(first.workspace.exists());
    assert!(first.marker_path().exists());
    harness.isolation.release(&mut first).await.unwrap();
    assert!(!first.workspace.exists());
    assert!(harness.workspace_entries().is_empty());

    let mut second = harness.isolation.acquire(&id).await.unwrap();
    // The freed name is reused rather than suffixed.
    assert_eq!(second.workspace, first.workspace);
    assert_eq!(harness.isolation.list_active().await.unwrap().len(), 1);
    harness.isolation.release(&mut second).await.unwrap();

    assert!(harness.workspace_entries().is_empty());
    assert!(harness.isolation.list_active().await.unwrap().is_empty());
    assert_eq!(harness.host.branch_count(), 0);
}

#[tokio::test]
async fn test_concurrent_contexts_never_share_a_workspace() {
    let harness = Harness::new();
    let mut contexts = Vec::new();
    for id in ["a/b", "a-b", "a_b", "a b"] {
        contexts.push(harness.isolation.acquire(&TaskId::from(id)).await.unwrap());
    }

    let workspaces: HashSet<_> = contexts.iter().map(|c| c.workspace.clone()).collect();
    let branches: HashSet<_> = contexts.iter().map(|c| c.branch.clone()).collect();
    assert_eq!(workspaces.len(), contexts.len());
    assert_eq!(branches.len(), contexts.len());

    for context in &mut contexts {
        harness.isolation.release(context).await.unwrap();
    }
    assert!(harness.workspace_entries().is_empty());
}

#[tokio::test]
async fn test_orphans_detected_after_crash() {
    let harness = Harness::new();
    // A context acquired and never released, as after a crash.
    let leaked = harness
        .isolation
        .acquire(&TaskId::from("leaked"))
        .await
        .unwrap();
    let mut kept = harness
        .isolation
        .acquire(&TaskId::from("kept"))
        .await
        .unwrap();

    let known: HashSet<TaskId> = [TaskId::from("kept")].into_iter().collect();
    let report = harness.isolation.detect_orphans(&known).await.unwrap();
    assert_eq!(report.orphaned_count(), 1);
    assert_eq!(report.orphaned[0].task_id, leaked.task_id);

    let removed = harness.isolation.remove_orphans(&report.orphaned).await;
    assert!(removed.is_success());
    assert!(!leaked.workspace.exists());

    harness.isolation.release(&mut kept).await.unwrap();
    assert!(harness.workspace_entries().is_empty());
}

#[tokio::test]
async fn test_aggregation_is_idempotent() {
    let harness = Harness::new();
    let id = TaskId::from("once");
    let mut context = harness.isolation.acquire(&id).await.unwrap();

    let first = harness.aggregator.integrate(&id, &context).await.unwrap();
    let second = harness.aggregator.integrate(&id, &context).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.host.merge_count(), 1);
    assert_eq!(harness.aggregator.outcome(&id).await, Some(first));
    harness.isolation.release(&mut context).await.unwrap();
}
