mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::FakeVcs;
use tempfile::TempDir;

use muster::config::{ConsolidationConfig, RegistryConfig};
use muster::consolidation::{
    ConflictType, Consolidation, ConsolidationStatus, Consolidator, MergeStrategy, Resolution,
    ResolutionAction,
};
use muster::error::MusterError;
use muster::events::EventBus;
use muster::registry::{Registry, RegistryStore, Worker};

struct Fixture {
    _dir: TempDir,
    project: PathBuf,
    registry: Arc<Registry>,
    vcs: Arc<FakeVcs>,
    consolidator: Consolidator,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("project");
    tokio::fs::create_dir_all(&project).await.unwrap();

    let events = EventBus::default();
    let registry = Arc::new(Registry::new(
        RegistryStore::new(dir.path().join("registry.json")),
        events.clone(),
        RegistryConfig::default(),
    ));
    let vcs = Arc::new(FakeVcs::new());
    let consolidator = Consolidator::new(
        &ConsolidationConfig::default(),
        dir.path().join("consolidations.json"),
        ".orch/worktrees".into(),
        vcs.clone(),
        Arc::clone(&registry),
        events,
    );

    Fixture {
        _dir: dir,
        project,
        registry,
        vcs,
        consolidator,
    }
}

/// Register a worker whose worktree contains `path` with `content`, and
/// script its diff against the base.
async fn seed_worker(f: &Fixture, id: &str, path: &str, content: &str, diff: &str) -> Worker {
    let worktree = f.project.join(".orch/worktrees").join(id);
    tokio::fs::create_dir_all(worktree.join(
        std::path::Path::new(path).parent().unwrap_or(std::path::Path::new("")),
    ))
    .await
    .unwrap();
    tokio::fs::write(worktree.join(path), content).await.unwrap();

    let worker = Worker::new(
        id,
        id,
        &f.project,
        "master",
        format!("agent/{id}"),
        &worktree,
    );
    f.registry.register(worker.clone());
    f.vcs.set_diff(&worktree, diff);
    worker
}

fn overlapping_diff(path: &str, marker: &str) -> String {
    format!(
        "diff --git a/{path} b/{path}\n\
         index 1111111..2222222 100644\n\
         --- a/{path}\n\
         +++ b/{path}\n\
         @@ -10,3 +10,3 @@\n\
         -old line one\n\
         -old line two\n\
         -old line three\n\
         +{marker} line one\n\
         +{marker} line two\n\
         +{marker} line three\n"
    )
}

#[tokio::test]
async fn battle_royale_five_workers_same_file() {
    let f = fixture().await;

    let path = "src/hot.rs";
    for i in 0..5 {
        let id = format!("w-{i}");
        seed_worker(
            &f,
            &id,
            path,
            &format!("// version {i}\nfn hot() {{}}\n"),
            &overlapping_diff(path, &format!("v{i}")),
        )
        .await;
    }

    let participants: Vec<String> = (0..5).map(|i| format!("w-{i}")).collect();
    let consolidation = f
        .consolidator
        .create(
            Some("battle".into()),
            f.project.clone(),
            "master".into(),
            participants,
            None,
        )
        .await
        .unwrap();
    assert_eq!(consolidation.status, ConsolidationStatus::Pending);

    // Analyze: every pair of the five workers conflicts on the same range.
    let preview = f.consolidator.analyze("battle").await.unwrap();
    assert_eq!(preview.total_files, 1);
    assert_eq!(preview.conflicting, 1);
    assert_eq!(preview.auto_mergeable, 0);
    assert_eq!(preview.conflicts.len(), 10);
    assert!(preview
        .conflicts
        .iter()
        .all(|c| c.conflict_type == ConflictType::SameLine));
    assert_eq!(preview.recommended, MergeStrategy::Voting);
    assert_eq!(preview.files.len(), 5);

    // Resolve keep-ours: the first worker of the first conflict pair wins.
    let plan = f
        .consolidator
        .resolve(
            "battle",
            vec![Resolution {
                path: path.into(),
                action: ResolutionAction::KeepOurs,
                source_worker: None,
                content: None,
            }],
        )
        .await
        .unwrap();
    assert_eq!(plan.files.len(), 1);
    assert_eq!(plan.files[0].source_worker.as_deref(), Some("w-0"));

    let ready = f.consolidator.get("battle").await.unwrap();
    assert_eq!(ready.status, ConsolidationStatus::Ready);

    // Export commits the chosen version onto the target branch.
    let result = f
        .consolidator
        .export("battle", "master-merged", "Merge battle royale")
        .await
        .unwrap();
    assert_eq!(result.merged, vec![path.to_string()]);
    assert!(result.failed.is_empty());
    assert!(result.commit.is_some());

    let done = f.consolidator.get("battle").await.unwrap();
    assert_eq!(done.status, ConsolidationStatus::Completed);

    // The export worktree saw exactly one commit with our message.
    let commits = f.vcs.commits.lock();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].1.contains("battle royale"));
}

#[tokio::test]
async fn create_validates_participants() {
    let f = fixture().await;

    assert!(matches!(
        f.consolidator
            .create(None, f.project.clone(), "main".into(), vec![], None)
            .await,
        Err(MusterError::Validation(_))
    ));

    assert!(matches!(
        f.consolidator
            .create(
                None,
                f.project.clone(),
                "main".into(),
                vec!["ghost".into()],
                None
            )
            .await,
        Err(MusterError::NotFound(_))
    ));
}

#[tokio::test]
async fn create_with_id_is_idempotent() {
    let f = fixture().await;
    seed_worker(&f, "w-0", "a.rs", "fn a() {}\n", "").await;

    let first = f
        .consolidator
        .create(
            Some("c-1".into()),
            f.project.clone(),
            "main".into(),
            vec!["w-0".into()],
            None,
        )
        .await
        .unwrap();
    let second = f
        .consolidator
        .create(
            Some("c-1".into()),
            f.project.clone(),
            "main".into(),
            vec!["w-0".into()],
            None,
        )
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(f.consolidator.list().await.len(), 1);
}

#[tokio::test]
async fn single_worker_analysis_is_conflict_free() {
    let f = fixture().await;
    seed_worker(
        &f,
        "w-solo",
        "src/lib.rs",
        "// tidy\npub fn solo() {}\n",
        &overlapping_diff("src/lib.rs", "solo"),
    )
    .await;

    f.consolidator
        .create(
            Some("solo".into()),
            f.project.clone(),
            "master".into(),
            vec!["w-solo".into()],
            None,
        )
        .await
        .unwrap();

    let preview = f.consolidator.analyze("solo").await.unwrap();
    assert_eq!(preview.total_files, 1);
    assert_eq!(preview.conflicting, 0);
    assert_eq!(preview.auto_mergeable, 1);
    assert_eq!(preview.recommended, MergeStrategy::Auto);

    // A single participant is perfectly consistent.
    let report = &preview.files[0];
    assert!((report.score.consistency - 1.0).abs() < 1e-9);
    assert!(report.score.total > 0.0);
}

#[tokio::test]
async fn resolve_rejects_unknown_paths_and_missing_manual_content() {
    let f = fixture().await;
    seed_worker(
        &f,
        "w-0",
        "src/a.rs",
        "fn a() {}\n",
        &overlapping_diff("src/a.rs", "a"),
    )
    .await;

    f.consolidator
        .create(
            Some("c".into()),
            f.project.clone(),
            "master".into(),
            vec!["w-0".into()],
            None,
        )
        .await
        .unwrap();
    f.consolidator.analyze("c").await.unwrap();

    assert!(matches!(
        f.consolidator
            .resolve(
                "c",
                vec![Resolution {
                    path: "src/never-touched.rs".into(),
                    action: ResolutionAction::Merge,
                    source_worker: None,
                    content: None,
                }],
            )
            .await,
        Err(MusterError::Validation(_))
    ));

    assert!(matches!(
        f.consolidator
            .resolve(
                "c",
                vec![Resolution {
                    path: "src/a.rs".into(),
                    action: ResolutionAction::Manual,
                    source_worker: None,
                    content: None,
                }],
            )
            .await,
        Err(MusterError::Validation(_))
    ));
}

#[tokio::test]
async fn rejected_paths_are_excluded_from_the_plan() {
    let f = fixture().await;
    seed_worker(
        &f,
        "w-0",
        "src/a.rs",
        "fn a() {}\n",
        &overlapping_diff("src/a.rs", "a"),
    )
    .await;

    f.consolidator
        .create(
            Some("c".into()),
            f.project.clone(),
            "master".into(),
            vec!["w-0".into()],
            None,
        )
        .await
        .unwrap();
    f.consolidator.analyze("c").await.unwrap();

    let plan = f
        .consolidator
        .resolve(
            "c",
            vec![Resolution {
                path: "src/a.rs".into(),
                action: ResolutionAction::Reject,
                source_worker: None,
                content: None,
            }],
        )
        .await
        .unwrap();
    assert!(plan.files.is_empty());
}

#[tokio::test]
async fn manual_content_lands_in_export() {
    let f = fixture().await;
    seed_worker(
        &f,
        "w-0",
        "src/a.rs",
        "fn a() {}\n",
        &overlapping_diff("src/a.rs", "a"),
    )
    .await;

    f.consolidator
        .create(
            Some("c".into()),
            f.project.clone(),
            "master".into(),
            vec!["w-0".into()],
            None,
        )
        .await
        .unwrap();
    f.consolidator.analyze("c").await.unwrap();
    f.consolidator
        .resolve(
            "c",
            vec![Resolution {
                path: "src/a.rs".into(),
                action: ResolutionAction::Manual,
                source_worker: None,
                content: Some("fn hand_merged() {}\n".into()),
            }],
        )
        .await
        .unwrap();

    let result = f
        .consolidator
        .export("c", "merged", "manual merge")
        .await
        .unwrap();
    assert_eq!(result.merged.len(), 1);

    // The export worktree is cleaned up afterwards, but the written file
    // passed through it; the fake recorded the removal.
    let export_dir = f.project.join(".orch/worktrees").join("consolidation-c");
    assert!(f.vcs.removed.lock().contains(&export_dir));
}

#[tokio::test]
async fn analyze_after_ready_is_rejected() {
    let f = fixture().await;
    seed_worker(
        &f,
        "w-0",
        "src/a.rs",
        "fn a() {}\n",
        &overlapping_diff("src/a.rs", "a"),
    )
    .await;

    f.consolidator
        .create(
            Some("c".into()),
            f.project.clone(),
            "master".into(),
            vec!["w-0".into()],
            None,
        )
        .await
        .unwrap();
    f.consolidator.analyze("c").await.unwrap();
    f.consolidator
        .resolve(
            "c",
            vec![Resolution {
                path: "src/a.rs".into(),
                action: ResolutionAction::Merge,
                source_worker: None,
                content: None,
            }],
        )
        .await
        .unwrap();

    assert!(matches!(
        f.consolidator.analyze("c").await,
        Err(MusterError::Conflict(_))
    ));
}

#[tokio::test]
async fn delete_consolidation() {
    let f = fixture().await;
    seed_worker(&f, "w-0", "a.rs", "fn a() {}\n", "").await;

    f.consolidator
        .create(
            Some("c".into()),
            f.project.clone(),
            "main".into(),
            vec!["w-0".into()],
            None,
        )
        .await
        .unwrap();

    f.consolidator.delete("c").await.unwrap();
    assert!(matches!(
        f.consolidator.delete("c").await,
        Err(MusterError::NotFound(_))
    ));
    assert!(f.consolidator.list().await.is_empty());
}

#[tokio::test]
async fn persistence_survives_reconstruction() {
    let dir = TempDir::new().unwrap();
    let store_path = dir.path().join("consolidations.json");
    let project = dir.path().join("project");
    tokio::fs::create_dir_all(&project).await.unwrap();

    let events = EventBus::default();
    let registry = Arc::new(Registry::new(
        RegistryStore::new(dir.path().join("registry.json")),
        events.clone(),
        RegistryConfig::default(),
    ));
    registry.register(Worker::new(
        "w-0",
        "w-0",
        &project,
        "main",
        "agent/w-0",
        project.join(".orch/worktrees/w-0"),
    ));

    {
        let consolidator = Consolidator::new(
            &ConsolidationConfig::default(),
            store_path.clone(),
            ".orch/worktrees".into(),
            Arc::new(FakeVcs::new()),
            Arc::clone(&registry),
            events.clone(),
        );
        consolidator
            .create(
                Some("persisted".into()),
                project.clone(),
                "main".into(),
                vec!["w-0".into()],
                Some(MergeStrategy::Voting),
            )
            .await
            .unwrap();
    }

    let reloaded = Consolidator::new(
        &ConsolidationConfig::default(),
        store_path,
        ".orch/worktrees".into(),
        Arc::new(FakeVcs::new()),
        registry,
        events,
    );
    let record: Consolidation = reloaded.get("persisted").await.unwrap();
    assert_eq!(record.strategy, MergeStrategy::Voting);
    assert_eq!(record.participants, vec!["w-0".to_string()]);
}
