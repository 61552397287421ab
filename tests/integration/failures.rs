//! Task-local failures: verification, retries, panics and blocked successors.

use std::time::Duration;

use foreman::checkpoint::CheckpointStore;
use foreman::core::{Batch, TaskId, TaskStatus};
use foreman::workflow::Phase;
use foreman::ErrorKind;

use crate::fixtures::{task, test_config, Behavior, Harness};

#[tokio::test]
async fn test_claimed_done_without_effects_fails_task() {
    let harness = Harness::new();
    harness.driver.script(
        "migrate",
        Behavior {
            claims_but_fails: Some(Phase::Implementation),
            ..Default::default()
        },
    );
    let batch = Batch::new(vec![
        task("migrate"),
        task("report").with_dependency("migrate"),
        task("docs"),
    ]);

    let report = harness.run(&batch).await;

    let migrate = report.get(&TaskId::from("migrate")).unwrap();
    assert!(matches!(migrate.status, TaskStatus::Failed { .. }));
    assert_eq!(migrate.error_kind, Some(ErrorKind::PhaseVerification));
    assert_eq!(migrate.phase, Some(Phase::Implementation));
    assert_eq!(migrate.last_checkpoint, Some(Phase::Planning));
    // Verification failures are never retried.
    assert_eq!(migrate.attempts, 1);
    assert_eq!(
        harness.driver.phases_run("migrate"),
        vec![Phase::Setup, Phase::Planning, Phase::Implementation]
    );

    let blocked = report.get(&TaskId::from("report")).unwrap();
    assert_eq!(
        blocked.status,
        TaskStatus::Blocked {
            blocked_by: TaskId::from("migrate")
        }
    );
    assert!(harness.driver.phases_run("report").is_empty());

    // Siblings are unaffected.
    assert_eq!(
        report.get(&TaskId::from("docs")).unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(report.exit_code(), 1);
    assert!(!report.succeeded());
}

#[tokio::test]
async fn test_failed_task_workspace_and_checkpoint_cleaned_up() {
    let harness = Harness::new();
    harness.driver.script(
        "broken",
        Behavior {
            fails_at: Some(Phase::Verification),
            ..Default::default()
        },
    );

    let report = harness.run(&Batch::new(vec![task("broken")])).await;

    let broken = report.get(&TaskId::from("broken")).unwrap();
    assert_eq!(broken.error_kind, Some(ErrorKind::PhaseExecution));
    assert_eq!(broken.phase, Some(Phase::Verification));
    assert!(harness.workspace_entries().is_empty());
    assert_eq!(harness.host.branch_count(), 0);
    assert!(harness.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new();
    harness.driver.script(
        "flaky",
        Behavior {
            transient_failures: 2,
            ..Default::default()
        },
    );

    let report = harness.run(&Batch::new(vec![task("flaky")])).await;

    let flaky = report.get(&TaskId::from("flaky")).unwrap();
    assert_eq!(flaky.status, TaskStatus::Completed);
    assert_eq!(flaky.attempts, 3);
    assert_eq!(flaky.error_kind, None);
    assert!(report.succeeded());
    assert_eq!(harness.host.merge_count(), 1);
}

#[tokio::test]
async fn test_retries_exhausted_then_terminal() {
    let harness = Harness::new();
    harness.driver.script(
        "down",
        Behavior {
            transient_failures: u32::MAX,
            ..Default::default()
        },
    );
    let batch = Batch::new(vec![task("down"), task("after").with_dependency("down")]);

    let report = harness.run(&batch).await;

    let down = report.get(&TaskId::from("down")).unwrap();
    assert!(matches!(down.status, TaskStatus::Failed { .. }));
    assert_eq!(down.error_kind, Some(ErrorKind::TransientDependency));
    // The first attempt plus three retries.
    assert_eq!(down.attempts, harness.config.scheduler.max_retries + 1);
    assert!(matches!(
        report.get(&TaskId::from("after")).unwrap().status,
        TaskStatus::Blocked { .. }
    ));
}

#[tokio::test]
async fn test_worker_panic_fails_only_that_task() {
    let harness = Harness::new();
    harness.driver.script(
        "boom",
        Behavior {
            panics_at: Some(Phase::Planning),
            ..Default::default()
        },
    );
    let batch = Batch::new(vec![task("boom"), task("calm")]);

    let report = harness.run(&batch).await;

    let boom = report.get(&TaskId::from("boom")).unwrap();
    assert!(matches!(boom.status, TaskStatus::Failed { .. }));
    assert_eq!(boom.error_kind, Some(ErrorKind::Internal));
    assert_eq!(
        report.get(&TaskId::from("calm")).unwrap().status,
        TaskStatus::Completed
    );
    assert!(harness.workspace_entries().is_empty());
}

#[tokio::test]
async fn test_integration_conflict_keeps_workspace() {
    let harness = Harness::new();
    harness.host.conflict_for("clash");
    let batch = Batch::new(vec![task("clash"), task("fine")]);

    let report = harness.run(&batch).await;

    let clash = report.get(&TaskId::from("clash")).unwrap();
    assert!(matches!(clash.status, TaskStatus::Failed { .. }));
    assert_eq!(clash.error_kind, Some(ErrorKind::IntegrationConflict));
    let integration = clash.integration.as_ref().expect("conflict recorded");
    assert!(integration.needs_manual_resolution());
    assert_eq!(integration.conflict_paths(), ["shared.txt".to_string()]);

    let kept = clash.kept_workspace.as_ref().expect("workspace kept");
    assert!(kept.join("finalization.out").exists());
    assert!(harness.store.load(&TaskId::from("clash")).await.unwrap().is_some());

    // Conflicts are not retried: one merge for each task.
    assert_eq!(harness.host.merge_count(), 2);
    assert_eq!(
        report.get(&TaskId::from("fine")).unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_phase_timeout_is_retried_then_releases_workspace() {
    let mut config = test_config();
    config.scheduler.max_retries = 1;
    config.phases.timeouts.insert("setup".to_string(), 1);
    let harness = Harness::with_config(config, Duration::from_millis(20));
    harness.driver.script(
        "stuck",
        Behavior {
            phase_delay: Some(Duration::from_millis(1500)),
            ..Default::default()
        },
    );
    let batch = Batch::new(vec![task("stuck"), task("after").with_dependency("stuck")]);

    let report = harness.run(&batch).await;

    let stuck = report.get(&TaskId::from("stuck")).unwrap();
    assert!(matches!(stuck.status, TaskStatus::Failed { .. }));
    assert_eq!(stuck.error_kind, Some(ErrorKind::Timeout));
    // Timeouts are transient: one retry, then terminal.
    assert_eq!(stuck.attempts, 2);
    assert_eq!(
        harness.driver.phases_run("stuck"),
        vec![Phase::Setup, Phase::Setup]
    );
    assert!(matches!(
        report.get(&TaskId::from("after")).unwrap().status,
        TaskStatus::Blocked { .. }
    ));

    // Each expired attempt gave its context back.
    assert!(harness.workspace_entries().is_empty());
    assert_eq!(harness.host.branch_count(), 0);
    assert_eq!(harness.host.merge_count(), 0);
}

#[tokio::test]
async fn test_store_outage_aborts_batch_with_partial_report() {
    let harness = Harness::new();
    let batch = Batch::new(vec![task("first"), task("second").with_dependency("first")]);

    // Take the store down as soon as the first task has been integrated.
    let host = harness.host.clone();
    let store = harness.store.clone();
    tokio::spawn(async move {
        while host.merge_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        store.set_unavailable(true);
    });

    let err = harness
        .coordinator()
        .run(&batch, tokio_util::sync::CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CheckpointStore);
    let report = err.partial_report().expect("partial report kept");
    assert!(report.aborted.is_some());
    assert_eq!(report.exit_code(), 2);
    assert_eq!(
        report.get(&TaskId::from("first")).unwrap().status,
        TaskStatus::Completed
    );
    let second = report.get(&TaskId::from("second")).unwrap();
    assert!(matches!(second.status, TaskStatus::Failed { .. }));
    assert_eq!(second.error_kind, Some(ErrorKind::CheckpointStore));
    assert_eq!(harness.host.merge_count(), 1);
}
