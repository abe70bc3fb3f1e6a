//! Durable index of workers keyed by id.
//!
//! The registry is the single writer for worker records. Mutations go
//! through a write lock, set a dirty flag, and a background task mirrors
//! the map to `registry.json`. Reads return snapshots.

mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::error::{MusterError, Result};
use crate::events::{EventBus, OrchEvent};

pub use store::RegistryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Pending,
    Active,
    Terminating,
    Completed,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Terminating => "terminating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "terminating" => Some(Self::Terminating),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single orchestrated unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub project: PathBuf,
    pub base_revision: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        project: impl Into<PathBuf>,
        base_revision: impl Into<String>,
        branch: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            worker_type: "worker".into(),
            status: WorkerStatus::Pending,
            project: project.into(),
            base_revision: base_revision.into(),
            branch: branch.into(),
            worktree_path: worktree_path.into(),
            task: None,
            pid: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_type(mut self, worker_type: impl Into<String>) -> Self {
        self.worker_type = worker_type.into();
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Partial update applied through [`Registry::update`]. Absent fields are
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct WorkerPatch {
    pub status: Option<WorkerStatus>,
    pub pid: Option<Option<u32>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<Option<String>>,
    pub task: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl WorkerPatch {
    pub fn status(status: WorkerStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }
}

pub struct Registry {
    inner: RwLock<HashMap<String, Worker>>,
    dirty: AtomicBool,
    store: RegistryStore,
    events: EventBus,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(store: RegistryStore, events: EventBus, config: RegistryConfig) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            store,
            events,
            config,
        }
    }

    /// Load the durable mirror. A corrupt file resets to an empty map.
    pub async fn load(&self) -> Result<usize> {
        let workers = self.store.load().await;
        let count = workers.len();
        let mut inner = self.inner.write();
        inner.clear();
        for worker in workers {
            inner.insert(worker.id.clone(), worker);
        }
        Ok(count)
    }

    /// Insert or replace a record. A replace that changes status also emits
    /// the deterministic transition event.
    pub fn register(&self, worker: Worker) {
        let id = worker.id.clone();
        let previous = {
            let mut inner = self.inner.write();
            let previous = inner.insert(id.clone(), worker.clone());
            self.prune_locked(&mut inner);
            previous
        };

        if let Some(prev) = previous
            && prev.status != worker.status
        {
            self.emit_transition(&id, prev.status, worker.status);
        }

        self.events.emit(OrchEvent::WorkerRegistered { id });
        self.mark_dirty();
    }

    /// Merge a patch into an existing record. Rejects timestamps that move
    /// before creation.
    pub fn update(&self, id: &str, patch: WorkerPatch) -> Result<Worker> {
        let (old_status, updated) = {
            let mut inner = self.inner.write();
            let worker = inner
                .get_mut(id)
                .ok_or_else(|| MusterError::NotFound(format!("worker {id}")))?;

            if let Some(at) = patch.started_at
                && at < worker.created_at
            {
                return Err(MusterError::Validation(
                    "started_at precedes worker creation".into(),
                ));
            }
            if let Some(at) = patch.completed_at
                && at < worker.created_at
            {
                return Err(MusterError::Validation(
                    "completed_at precedes worker creation".into(),
                ));
            }

            let old_status = worker.status;
            if let Some(status) = patch.status {
                worker.status = status;
            }
            if let Some(pid) = patch.pid {
                worker.pid = pid;
            }
            if let Some(at) = patch.started_at {
                worker.started_at = Some(at);
            }
            if let Some(at) = patch.completed_at {
                worker.completed_at = Some(at);
            }
            if let Some(error) = patch.error {
                worker.error = error;
            }
            if let Some(task) = patch.task {
                worker.task = Some(task);
            }
            if let Some(metadata) = patch.metadata {
                worker.metadata.extend(metadata);
            }
            (old_status, worker.clone())
        };

        if old_status != updated.status {
            self.emit_transition(id, old_status, updated.status);
        }
        self.events.emit(OrchEvent::WorkerUpdated { id: id.into() });
        self.mark_dirty();
        Ok(updated)
    }

    pub fn unregister(&self, id: &str) -> Result<Worker> {
        let removed = {
            let mut inner = self.inner.write();
            inner.remove(id)
        }
        .ok_or_else(|| MusterError::NotFound(format!("worker {id}")))?;

        self.events
            .emit(OrchEvent::WorkerUnregistered { id: id.into() });
        self.mark_dirty();
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Worker> {
        self.inner.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<_> = self.inner.read().values().cloned().collect();
        workers.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        workers
    }

    pub fn by_status(&self, status: WorkerStatus) -> Vec<Worker> {
        self.inner
            .read()
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect()
    }

    pub fn by_branch(&self, branch: &str) -> Option<Worker> {
        self.inner
            .read()
            .values()
            .find(|w| w.branch == branch)
            .cloned()
    }

    /// Prefix match on the worktree path, so queries for a parent directory
    /// include nested worktrees.
    pub fn by_worktree_prefix(&self, prefix: &Path) -> Vec<Worker> {
        self.inner
            .read()
            .values()
            .filter(|w| w.worktree_path.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn by_project(&self, project: &Path) -> Vec<Worker> {
        self.inner
            .read()
            .values()
            .filter(|w| w.project == project)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|w| {
                matches!(
                    w.status,
                    WorkerStatus::Pending | WorkerStatus::Active | WorkerStatus::Terminating
                )
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Write the current snapshot to disk if anything changed. Persistence
    /// errors are logged, never surfaced: the in-memory map is authoritative.
    pub async fn flush(&self) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let snapshot = self.list();
        if let Err(e) = self.store.save(&snapshot).await {
            warn!(error = %e, "Registry persistence failed, will retry on next mutation");
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    /// Background persistence driven by the dirty flag.
    pub fn start_persistence(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.flush().await;
            }
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    fn emit_transition(&self, id: &str, old: WorkerStatus, new: WorkerStatus) {
        self.events.emit(OrchEvent::WorkerStatusChanged {
            id: id.into(),
            old: old.as_str().into(),
            new: new.as_str().into(),
        });
        self.events.emit(OrchEvent::WorkerTransition {
            id: id.into(),
            old: old.as_str().into(),
            new: new.as_str().into(),
        });
    }

    /// At the ceiling, drop terminal records older than the retention
    /// window (by completion time, or consider them expired if unset).
    fn prune_locked(&self, inner: &mut HashMap<String, Worker>) {
        if inner.len() < self.config.max_records {
            return;
        }
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.terminal_retention_hours);
        let stale: Vec<String> = inner
            .values()
            .filter(|w| w.status.is_terminal() && w.completed_at.is_some_and(|at| at < cutoff))
            .map(|w| w.id.clone())
            .collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "Pruning terminal worker records");
            for id in stale {
                inner.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_registry() -> (TempDir, Arc<Registry>) {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        let registry = Arc::new(Registry::new(
            store,
            EventBus::default(),
            RegistryConfig::default(),
        ));
        (dir, registry)
    }

    fn worker(id: &str) -> Worker {
        Worker::new(
            id,
            format!("worker {id}"),
            "/repo",
            "main",
            format!("agent/{id}"),
            format!("/repo/.orch/worktrees/{id}"),
        )
    }

    #[test]
    fn test_register_query_unregister_roundtrip() {
        let (_dir, registry) = temp_registry();

        registry.register(worker("w-1"));
        assert!(registry.get("w-1").is_some());

        registry.unregister("w-1").unwrap();
        assert!(registry.get("w-1").is_none());
        assert!(matches!(
            registry.unregister("w-1"),
            Err(MusterError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_patch_and_transition() {
        let (_dir, registry) = temp_registry();
        let mut rx = registry.events.subscribe();

        registry.register(worker("w-1"));
        let updated = registry
            .update(
                "w-1",
                WorkerPatch::status(WorkerStatus::Active)
                    .with_pid(Some(42))
                    .with_started_at(Utc::now()),
            )
            .unwrap();

        assert_eq!(updated.status, WorkerStatus::Active);
        assert_eq!(updated.pid, Some(42));

        // registered, then status_changed + transition + updated
        let mut topics = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            topics.push(ev.topic());
        }
        assert!(topics.contains(&"worker:registered".to_string()));
        assert!(topics.contains(&"worker:status_changed".to_string()));
        assert!(topics.contains(&"worker:transition:pending:active".to_string()));
        assert!(topics.contains(&"worker:updated".to_string()));
    }

    #[test]
    fn test_update_rejects_invalid_timestamps() {
        let (_dir, registry) = temp_registry();
        registry.register(worker("w-1"));

        let before_creation = Utc::now() - chrono::Duration::hours(1);
        let result = registry.update(
            "w-1",
            WorkerPatch::default().with_completed_at(before_creation),
        );
        assert!(matches!(result, Err(MusterError::Validation(_))));
    }

    #[test]
    fn test_queries() {
        let (_dir, registry) = temp_registry();
        registry.register(worker("w-1"));
        let mut other = worker("w-2");
        other.project = PathBuf::from("/other");
        other.status = WorkerStatus::Active;
        registry.register(other);

        assert_eq!(registry.by_status(WorkerStatus::Active).len(), 1);
        assert_eq!(registry.by_project(Path::new("/repo")).len(), 1);
        assert!(registry.by_branch("agent/w-1").is_some());
        assert_eq!(
            registry
                .by_worktree_prefix(Path::new("/repo/.orch/worktrees"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        {
            let store = RegistryStore::new(path.clone());
            let registry = Registry::new(store, EventBus::default(), RegistryConfig::default());
            registry.register(worker("w-1"));
            registry.register(worker("w-2"));
            registry.flush().await;
        }

        let store = RegistryStore::new(path);
        let registry = Registry::new(store, EventBus::default(), RegistryConfig::default());
        let loaded = registry.load().await.unwrap();
        assert_eq!(loaded, 2);
        assert!(registry.get("w-1").is_some());
        assert!(registry.get("w-2").is_some());
    }

    #[tokio::test]
    async fn test_corrupt_file_resets_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(&path, b"{not valid json").await.unwrap();

        let store = RegistryStore::new(path);
        let registry = Registry::new(store, EventBus::default(), RegistryConfig::default());
        let loaded = registry.load().await.unwrap();
        assert_eq!(loaded, 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_prune_removes_old_terminal_records() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path().join("registry.json"));
        let config = RegistryConfig {
            max_records: 2,
            terminal_retention_hours: 24,
        };
        let registry = Registry::new(store, EventBus::default(), config);

        let mut old = worker("w-old");
        old.status = WorkerStatus::Completed;
        old.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
        registry.register(old);
        registry.register(worker("w-1"));
        registry.register(worker("w-2"));

        assert!(registry.get("w-old").is_none());
        assert!(registry.get("w-2").is_some());
    }
}
