//! Whole batches against a real repository with the command driver.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use foreman::checkpoint::{CheckpointStore, FileCheckpointStore};
use foreman::core::{Batch, TaskDescriptor, TaskId, TaskStatus};
use foreman::hosts::{GitHost, MergeOutcome, VersionControlHost};
use foreman::isolation::IsolationManager;
use foreman::orchestration::{Coordinator, ResultAggregator};
use foreman::ErrorKind;

use crate::fixtures::{test_config, TestRepo, TARGET};

struct GitSetup {
    repo: TestRepo,
    isolation: Arc<IsolationManager>,
    store: Arc<FileCheckpointStore>,
    coordinator: Coordinator,
}

fn setup() -> GitSetup {
    let repo = TestRepo::new();
    let config = test_config();
    let host: Arc<dyn VersionControlHost> =
        Arc::new(GitHost::open(&repo.path).expect("open repo"));
    let isolation = Arc::new(
        IsolationManager::new(&config.isolation, repo.sibling("workspaces"), host.clone())
            .expect("isolation manager"),
    );
    let aggregator = Arc::new(ResultAggregator::new(host, TARGET));
    let store = Arc::new(FileCheckpointStore::new(repo.sibling("checkpoints")));
    let coordinator = Coordinator::new(&config, isolation.clone(), aggregator, store.clone());
    GitSetup {
        repo,
        isolation,
        store,
        coordinator,
    }
}

/// A command task that writes `contents` to `file` and verifies it.
fn writes(id: &str, file: &str, contents: &str) -> TaskDescriptor {
    TaskDescriptor::new(id).with_payload(json!({
        "phases": {
            "implementation": {
                "run": format!("printf '%s\\n' '{}' > {}", contents, file),
                "artifacts": [file],
            },
            "verification": {
                "verify": format!("grep -q '{}' {}", contents, file),
            },
        }
    }))
}

#[tokio::test]
async fn test_batch_integrates_every_task_into_target() {
    let setup = setup();
    let batch = Batch::new(vec![
        writes("alpha", "alpha.txt", "alpha"),
        writes("beta", "beta.txt", "beta"),
    ]);

    let report = setup
        .coordinator
        .run(&batch, CancellationToken::new())
        .await
        .unwrap();

    assert!(report.succeeded(), "report: {}", report.to_json().unwrap());
    assert_eq!(
        setup.repo.file_on_branch(TARGET, "alpha.txt").as_deref(),
        Some("alpha\n")
    );
    assert_eq!(
        setup.repo.file_on_branch(TARGET, "beta.txt").as_deref(),
        Some("beta\n")
    );
    // The coordinating checkout is untouched.
    assert!(!setup.repo.path.join("alpha.txt").exists());
    assert_eq!(setup.repo.git(&["rev-parse", "--abbrev-ref", "HEAD"]).trim(), "main");

    // Task branches, worktrees and checkpoints are gone.
    assert!(setup.repo.git(&["branch", "--list", "foreman/*"]).trim().is_empty());
    assert!(setup.isolation.list_active().await.unwrap().is_empty());
    assert!(setup.store.list().await.unwrap().is_empty());

    for task in &report.tasks {
        let integration = task.integration.as_ref().expect("integrated");
        assert!(integration.committed);
        assert!(matches!(integration.merge, MergeOutcome::Merged { .. }));
    }
}

#[tokio::test]
async fn test_overlapping_edits_need_manual_resolution() {
    let setup = setup();
    let batch = Batch::new(vec![
        writes("one", "shared.txt", "first").with_resources(["shared.txt"]),
        writes("two", "shared.txt", "second").with_resources(["shared.txt"]),
    ]);

    let report = setup
        .coordinator
        .run(&batch, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        report.get(&TaskId::from("one")).unwrap().status,
        TaskStatus::Completed
    );
    let two = report.get(&TaskId::from("two")).unwrap();
    assert_eq!(two.error_kind, Some(ErrorKind::IntegrationConflict));
    let integration = two.integration.as_ref().unwrap();
    assert_eq!(integration.conflict_paths(), ["shared.txt".to_string()]);

    // Nothing from the conflicting task reached the target.
    assert_eq!(
        setup.repo.file_on_branch(TARGET, "shared.txt").as_deref(),
        Some("first\n")
    );
    let kept = two.kept_workspace.as_ref().expect("workspace kept");
    assert_eq!(
        std::fs::read_to_string(kept.join("shared.txt")).unwrap(),
        "second\n"
    );
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_failed_verify_command_is_reported() {
    let setup = setup();
    let batch = Batch::new(vec![TaskDescriptor::new("liar").with_payload(json!({
        "phases": {
            "implementation": { "run": "true", "verify": "test -f never.txt" }
        }
    }))]);

    let report = setup
        .coordinator
        .run(&batch, CancellationToken::new())
        .await
        .unwrap();

    let liar = report.get(&TaskId::from("liar")).unwrap();
    assert_eq!(liar.error_kind, Some(ErrorKind::PhaseVerification));
    assert!(setup.repo.file_on_branch(TARGET, "README.md").is_none());
    assert!(setup.isolation.list_active().await.unwrap().is_empty());
}
