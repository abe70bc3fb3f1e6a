//! Engine composition root.
//!
//! Wires every subsystem together with explicit lifecycle: construct,
//! `start()` to rehydrate durable state and spawn background loops,
//! `shutdown()` to terminate workers and flush state. No global
//! singletons; everything is dependency-injected from here.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{MessageBus, MessageStore, SupervisorSink};
use crate::config::{OrchConfig, OrchPaths};
use crate::consolidation::Consolidator;
use crate::coordination::Coordinator;
use crate::error::Result;
use crate::events::EventBus;
use crate::monitor::{BreachNotice, ResourceMonitor};
use crate::registry::{Registry, RegistryStore, WorkerPatch, WorkerStatus};
use crate::supervisor::{TermReason, WorkerSupervisor};
use crate::vcs::{GitCli, VcsAdapter, WorktreeInfo};

pub struct Engine {
    config: OrchConfig,
    paths: OrchPaths,
    events: EventBus,
    registry: Arc<Registry>,
    vcs: Arc<dyn VcsAdapter>,
    monitor: Arc<ResourceMonitor>,
    supervisor: Arc<WorkerSupervisor>,
    bus: Arc<MessageBus>,
    coordinator: Arc<Coordinator>,
    consolidator: Arc<Consolidator>,
    breach_rx: Mutex<Option<mpsc::Receiver<BreachNotice>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: OrchConfig, paths: OrchPaths) -> Arc<Self> {
        Self::with_vcs(config, paths, Arc::new(GitCli::new()))
    }

    /// Build the engine with a caller-supplied VCS adapter (tests inject an
    /// in-process fake here).
    pub fn with_vcs(config: OrchConfig, paths: OrchPaths, vcs: Arc<dyn VcsAdapter>) -> Arc<Self> {
        let events = EventBus::default();

        let registry = Arc::new(Registry::new(
            RegistryStore::new(paths.registry_file.clone()),
            events.clone(),
            config.registry.clone(),
        ));

        let (breach_tx, breach_rx) = mpsc::channel(64);
        let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone(), breach_tx));

        let supervisor = Arc::new(WorkerSupervisor::new(
            config.supervisor.clone(),
            Arc::clone(&registry),
            Arc::clone(&vcs),
            Arc::clone(&monitor),
            events.clone(),
        ));

        let bus = Arc::new(MessageBus::new(
            config.bus.clone(),
            MessageStore::new(paths.messages_dir.clone()),
            Arc::clone(&registry),
            Arc::new(SupervisorSink::new(Arc::clone(&supervisor))),
            events.clone(),
        ));

        let coordinator = Arc::new(Coordinator::new(events.clone()));

        let consolidator = Arc::new(Consolidator::new(
            &config.consolidation,
            paths.consolidations_file.clone(),
            config.supervisor.worktree_root.clone(),
            Arc::clone(&vcs),
            Arc::clone(&registry),
            events.clone(),
        ));

        Arc::new(Self {
            config,
            paths,
            events,
            registry,
            vcs,
            monitor,
            supervisor,
            bus,
            coordinator,
            consolidator,
            breach_rx: Mutex::new(Some(breach_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Rehydrate durable state and spawn the background loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.paths.ensure_dirs().await?;
        self.paths.recover_interrupted_writes().await;

        let loaded = self.registry.load().await?;
        self.fail_orphaned_records();
        self.cleanup_orphaned_worktrees().await;
        self.cleanup_orphaned_branches().await;

        let rehydrated = self.bus.rehydrate().await?;
        self.bus.start();

        let persist_handle = self.registry.start_persistence(Duration::from_secs(1));

        // Memory-limit breaches terminate through the supervisor so the
        // monitor never owns process handles.
        let breach_handle = {
            let engine = Arc::clone(self);
            let Some(mut rx) = self.breach_rx.lock().take() else {
                return Err(crate::error::MusterError::Conflict(
                    "engine already started".into(),
                ));
            };
            tokio::spawn(async move {
                while let Some(notice) = rx.recv().await {
                    if let Err(e) = engine
                        .supervisor
                        .terminate(&notice.worker_id, TermReason::MemoryLimit)
                    {
                        warn!(worker_id = %notice.worker_id, error = %e, "Memory-limit termination failed");
                    }
                }
            })
        };

        self.tasks.lock().extend([persist_handle, breach_handle]);
        info!(
            workers = loaded,
            messages = rehydrated,
            "Orchestrator engine started"
        );
        Ok(())
    }

    /// Terminate all workers, stop the loops, and flush durable state.
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.supervisor.shutdown().await;
        self.monitor.shutdown();
        self.bus.stop();
        self.registry.flush().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Records that claim to be live but whose process did not survive a
    /// previous engine run.
    fn fail_orphaned_records(&self) {
        for status in [
            WorkerStatus::Pending,
            WorkerStatus::Active,
            WorkerStatus::Terminating,
        ] {
            for worker in self.registry.by_status(status) {
                let _ = self.registry.update(
                    &worker.id,
                    WorkerPatch::status(WorkerStatus::Failed)
                        .with_completed_at(Utc::now())
                        .with_error("orphaned by engine restart"),
                );
            }
        }
    }

    /// Remove worktree directories with no corresponding registry record.
    async fn cleanup_orphaned_worktrees(&self) {
        let mut projects: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .map(|w| w.project)
            .collect();
        projects.sort();
        projects.dedup();

        for project in projects {
            let root = self.paths.project_worktrees(&project);
            let Ok(mut dir) = tokio::fs::read_dir(&root).await else {
                continue;
            };

            while let Ok(Some(entry)) = dir.next_entry().await {
                let path = entry.path();
                if self.registry.by_worktree_prefix(&path).is_empty() {
                    warn!(path = %path.display(), "Cleaning up orphaned worktree");
                    if self.vcs.worktree_remove(&project, &path).await.is_err()
                        && let Err(e) = tokio::fs::remove_dir_all(&path).await
                    {
                        warn!(path = %path.display(), error = %e, "Force remove failed");
                    }
                }
            }
        }
    }

    /// Delete generated branches that no longer belong to any worker.
    async fn cleanup_orphaned_branches(&self) {
        let prefix = format!("{}/", self.config.supervisor.branch_prefix);
        let mut projects: Vec<_> = self
            .registry
            .list()
            .into_iter()
            .map(|w| w.project)
            .collect();
        projects.sort();
        projects.dedup();

        for project in projects {
            let branches = match self.vcs.list_branches(&project, &prefix).await {
                Ok(branches) => branches,
                Err(e) => {
                    warn!(project = %project.display(), error = %e, "Branch listing failed");
                    continue;
                }
            };
            for branch in branches {
                if self.registry.by_branch(&branch).is_none() {
                    match self.vcs.delete_branch(&project, &branch).await {
                        Ok(true) => warn!(branch = %branch, "Deleted orphaned branch"),
                        Ok(false) => {}
                        Err(e) => warn!(branch = %branch, error = %e, "Branch delete failed"),
                    }
                }
            }
        }
    }

    /// Adapter worktree listing filtered to worker-owned entries.
    pub async fn worker_worktrees(&self, project: &Path) -> Result<Vec<WorktreeInfo>> {
        let all = self.vcs.list_worktrees(project).await?;
        Ok(all
            .into_iter()
            .filter(|wt| !self.registry.by_worktree_prefix(&wt.path).is_empty())
            .collect())
    }

    pub fn config(&self) -> &OrchConfig {
        &self.config
    }

    pub fn paths(&self) -> &OrchPaths {
        &self.paths
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn vcs(&self) -> &Arc<dyn VcsAdapter> {
        &self.vcs
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn supervisor(&self) -> &Arc<WorkerSupervisor> {
        &self.supervisor
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn consolidator(&self) -> &Arc<Consolidator> {
        &self.consolidator
    }
}
