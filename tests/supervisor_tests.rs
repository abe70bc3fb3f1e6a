mod common;

use common::{harness, harness_with, test_config, wait_for};
use muster::error::MusterError;
use muster::registry::WorkerStatus;
use muster::supervisor::{SpawnRequest, TermReason};

fn shell(project: &std::path::Path, name: &str, script: &str) -> SpawnRequest {
    SpawnRequest::new(project, name, "main")
        .with_command("sh", vec!["-c".into(), script.into()])
}

#[tokio::test]
async fn spawn_runs_to_completion() {
    let h = harness().await;
    let mut events = h.engine.events().subscribe();

    let worker = h
        .engine
        .supervisor()
        .spawn(shell(&h.project, "quick", "exit 0"))
        .await
        .unwrap();

    assert_eq!(worker.status, WorkerStatus::Active);
    assert!(worker.pid.is_some());
    assert!(worker.branch.starts_with("agent/quick-"));
    assert!(worker
        .worktree_path
        .starts_with(h.project.join(".orch/worktrees")));

    let registry = h.engine.registry().clone();
    let id = worker.id.clone();
    wait_for(5000, || {
        registry.get(&id).is_some_and(|w| w.status == WorkerStatus::Completed)
    })
    .await;

    let done = registry.get(&id).unwrap();
    assert!(done.error.is_none());
    assert!(done.completed_at.is_some());

    let mut topics = Vec::new();
    while let Ok(event) = events.try_recv() {
        topics.push(event.topic());
    }
    assert!(topics.contains(&"worker:spawning".to_string()));
    assert!(topics.contains(&"worker:spawned".to_string()));
    assert!(topics.contains(&"worker:transition:active:completed".to_string()));
    assert!(topics.contains(&"worker:exit".to_string()));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn child_sees_isolation_environment() {
    let h = harness().await;

    let worker = h
        .engine
        .supervisor()
        .spawn(shell(&h.project, "env-probe", "echo \"$AGENT_ID $AGENT_ISOLATED $AGENT_ENV\""))
        .await
        .unwrap();

    let supervisor = h.engine.supervisor().clone();
    let id = worker.id.clone();
    wait_for(5000, || {
        supervisor
            .logs(&id, 0, 10)
            .is_ok_and(|(lines, _)| !lines.is_empty())
    })
    .await;

    let (lines, _) = h.engine.supervisor().logs(&worker.id, 0, 10).unwrap();
    assert_eq!(lines[0].line, format!("{} 1 production", worker.id));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn nonzero_exit_is_reported_as_failed() {
    let h = harness().await;

    let worker = h
        .engine
        .supervisor()
        .spawn(shell(&h.project, "crasher", "exit 3"))
        .await
        .unwrap();

    let registry = h.engine.registry().clone();
    let id = worker.id.clone();
    wait_for(5000, || {
        registry.get(&id).is_some_and(|w| w.status == WorkerStatus::Failed)
    })
    .await;

    let failed = registry.get(&id).unwrap();
    assert_eq!(failed.error.as_deref(), Some("exit code 3"));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn capacity_is_enforced_at_the_cap() {
    let mut config = test_config();
    config.supervisor.max_active_workers = 2;
    let h = harness_with(config).await;

    let a = h
        .engine
        .supervisor()
        .spawn(shell(&h.project, "sleeper", "sleep 30"))
        .await
        .unwrap();
    let _b = h
        .engine
        .supervisor()
        .spawn(shell(&h.project, "sleeper", "sleep 30"))
        .await
        .unwrap();

    let over = h
        .engine
        .supervisor()
        .spawn(shell(&h.project, "sleeper", "sleep 30"))
        .await;
    assert!(matches!(
        over,
        Err(MusterError::CapacityExceeded { active: 2, cap: 2 })
    ));
    // The rejected spawn left no worktree behind.
    assert_eq!(h.engine.registry().len(), 2);

    // Releasing a slot admits the next spawn.
    h.engine
        .supervisor()
        .terminate(&a.id, TermReason::UserInitiated)
        .unwrap();
    let registry = h.engine.registry().clone();
    let id = a.id.clone();
    wait_for(8000, || {
        registry.get(&id).is_some_and(|w| w.status.is_terminal())
    })
    .await;

    h.engine
        .supervisor()
        .spawn(shell(&h.project, "sleeper", "sleep 30"))
        .await
        .unwrap();

    h.engine.shutdown().await;
}

#[tokio::test]
async fn terminate_is_first_ok_then_not_found() {
    let h = harness().await;

    let worker = h
        .engine
        .supervisor()
        .spawn(shell(&h.project, "sleeper", "sleep 30"))
        .await
        .unwrap();

    h.engine
        .supervisor()
        .terminate(&worker.id, TermReason::UserInitiated)
        .unwrap();

    let registry = h.engine.registry().clone();
    let id = worker.id.clone();
    wait_for(8000, || {
        registry.get(&id).is_some_and(|w| w.status.is_terminal())
    })
    .await;

    assert!(matches!(
        h.engine
            .supervisor()
            .terminate(&worker.id, TermReason::UserInitiated),
        Err(MusterError::NotFound(_))
    ));

    // Termination reclaims the working copy.
    assert!(h.vcs.removed.lock().contains(&worker.worktree_path));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn spawn_failure_rolls_back_worktree() {
    let h = harness().await;

    let request = SpawnRequest::new(&h.project, "broken", "main").with_command(
        "/nonexistent-binary-for-muster-tests",
        vec![],
    );
    let result = h.engine.supervisor().spawn(request).await;
    assert!(matches!(result, Err(MusterError::Spawn(_))));

    // The registry records the failure and the worktree was removed.
    let workers = h.engine.registry().by_status(WorkerStatus::Failed);
    assert_eq!(workers.len(), 1);
    assert!(!h.vcs.removed.lock().is_empty());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn vcs_failure_rolls_back_registration() {
    let h = harness().await;
    h.vcs
        .fail_worktree_add
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let result = h
        .engine
        .supervisor()
        .spawn(shell(&h.project, "doomed", "exit 0"))
        .await;
    assert!(matches!(result, Err(MusterError::Vcs { .. })));
    assert!(h.engine.registry().is_empty());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn spawn_validation() {
    let h = harness().await;

    let result = h
        .engine
        .supervisor()
        .spawn(SpawnRequest::new(&h.project, "", "main"))
        .await;
    assert!(matches!(result, Err(MusterError::Validation(_))));

    let result = h
        .engine
        .supervisor()
        .spawn(SpawnRequest::new("relative/path", "x", "main"))
        .await;
    assert!(matches!(result, Err(MusterError::Validation(_))));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn stdin_send_reaches_child() {
    let h = harness().await;

    // `cat` echoes stdin back to stdout, which lands in the log buffer.
    let worker = h
        .engine
        .supervisor()
        .spawn(SpawnRequest::new(&h.project, "echoer", "main").with_command("cat", vec![]))
        .await
        .unwrap();

    h.engine
        .supervisor()
        .send(&worker.id, &serde_json::json!("ping"))
        .await
        .unwrap();

    let supervisor = h.engine.supervisor().clone();
    let id = worker.id.clone();
    wait_for(5000, || {
        supervisor
            .logs(&id, 0, 10)
            .is_ok_and(|(lines, _)| lines.iter().any(|l| l.line == "ping"))
    })
    .await;

    assert!(matches!(
        h.engine
            .supervisor()
            .send("missing-worker", &serde_json::json!("x"))
            .await,
        Err(MusterError::NotFound(_))
    ));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_terminates_all_children() {
    let h = harness().await;

    for i in 0..3 {
        h.engine
            .supervisor()
            .spawn(shell(&h.project, &format!("s{i}"), "sleep 60"))
            .await
            .unwrap();
    }
    assert_eq!(h.engine.supervisor().active_count(), 3);

    h.engine.shutdown().await;
    assert_eq!(h.engine.supervisor().active_count(), 0);

    for worker in h.engine.registry().list() {
        assert!(worker.status.is_terminal());
    }
}
