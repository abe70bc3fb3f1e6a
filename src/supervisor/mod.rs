//! Worker lifecycle and isolation engine.
//!
//! Spawns supervised child processes inside per-worker git worktrees,
//! wires their stdio, enforces the wall-clock budget, and reaps exits back
//! into the registry. Termination is gentle first (SIGTERM), forceful
//! after the grace period.

mod logs;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Semaphore, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{MusterError, Result};
use crate::events::{EventBus, OrchEvent};
use crate::monitor::ResourceMonitor;
use crate::registry::{Registry, Worker, WorkerPatch, WorkerStatus};
use crate::utils::{short_id, slug};
use crate::vcs::VcsAdapter;

pub use logs::{LogBuffer, LogLine, LogStream};

/// Canonical termination reasons. No freeform reasons are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermReason {
    UserInitiated,
    Timeout,
    MemoryLimit,
    Shutdown,
}

impl TermReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInitiated => "user_initiated",
            Self::Timeout => "timeout",
            Self::MemoryLimit => "memory_limit",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for TermReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub project: PathBuf,
    pub name: String,
    pub worker_type: String,
    pub base_revision: String,
    pub branch: Option<String>,
    pub task: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SpawnRequest {
    pub fn new(
        project: impl Into<PathBuf>,
        name: impl Into<String>,
        base_revision: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
            worker_type: "worker".into(),
            base_revision: base_revision.into(),
            branch: None,
            task: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(command.into());
        self.args = args;
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MusterError::Validation("worker name is required".into()));
        }
        if self.base_revision.trim().is_empty() {
            return Err(MusterError::Validation("base revision is required".into()));
        }
        if !self.project.is_absolute() {
            return Err(MusterError::Validation(
                "project must be an absolute path".into(),
            ));
        }
        Ok(())
    }
}

struct ChildHandle {
    pid: u32,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    term_tx: watch::Sender<Option<TermReason>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    registry: Arc<Registry>,
    vcs: Arc<dyn VcsAdapter>,
    monitor: Arc<ResourceMonitor>,
    events: EventBus,
    slots: Arc<Semaphore>,
    handles: DashMap<String, ChildHandle>,
    logs: DashMap<String, Arc<LogBuffer>>,
}

impl WorkerSupervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<Registry>,
        vcs: Arc<dyn VcsAdapter>,
        monitor: Arc<ResourceMonitor>,
        events: EventBus,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_active_workers));
        Self {
            config,
            registry,
            vcs,
            monitor,
            events,
            slots,
            handles: DashMap::new(),
            logs: DashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.config.max_active_workers - self.slots.available_permits()
    }

    /// Spawn one worker: reserve a slot, create its worktree, register it,
    /// start the child process, and arm the wall-clock timer.
    pub async fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<Worker> {
        request.validate()?;

        let permit = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            MusterError::CapacityExceeded {
                active: self.active_count(),
                cap: self.config.max_active_workers,
            }
        })?;

        let id = Uuid::new_v4().to_string();
        let branch = request.branch.clone().unwrap_or_else(|| {
            format!(
                "{}/{}-{}",
                self.config.branch_prefix,
                slug(&request.name),
                short_id(&id)
            )
        });
        let worktree = request
            .project
            .join(&self.config.worktree_root)
            .join(&id);

        let worker = Worker::new(
            &id,
            &request.name,
            &request.project,
            &request.base_revision,
            &branch,
            &worktree,
        )
        .with_type(&request.worker_type)
        .with_metadata(request.metadata.clone());
        let worker = match request.task.clone() {
            Some(task) => worker.with_task(task),
            None => worker,
        };
        self.registry.register(worker);

        if let Err(e) = self
            .vcs
            .worktree_add(&request.project, &worktree, &branch, &request.base_revision)
            .await
        {
            // Roll back the partial registration before surfacing.
            let _ = self.registry.unregister(&id);
            drop(permit);
            return Err(e);
        }

        self.events.emit(OrchEvent::WorkerSpawning {
            id: id.clone(),
            name: request.name.clone(),
            worktree: worktree.display().to_string(),
        });

        let mut child = match self.spawn_process(&request, &id, &worktree) {
            Ok(child) => child,
            Err(e) => {
                let _ = self.registry.update(
                    &id,
                    WorkerPatch::status(WorkerStatus::Failed)
                        .with_completed_at(Utc::now())
                        .with_error(e.to_string()),
                );
                self.events.emit(OrchEvent::WorkerSpawnFailed {
                    id: Some(id.clone()),
                    error: e.to_string(),
                });
                if let Err(cleanup) = self.vcs.worktree_remove(&request.project, &worktree).await {
                    warn!(worker_id = %id, error = %cleanup, "Worktree cleanup after spawn failure failed");
                }
                drop(permit);
                return Err(e);
            }
        };

        let pid = child.id().unwrap_or_default();
        self.registry.update(
            &id,
            WorkerPatch::status(WorkerStatus::Active)
                .with_pid(Some(pid))
                .with_started_at(Utc::now()),
        )?;

        let buffer = Arc::new(LogBuffer::new(self.config.log_buffer_lines));
        self.logs.insert(id.clone(), Arc::clone(&buffer));
        if let Some(stdout) = child.stdout.take() {
            self.pipe_stream(stdout, LogStream::Stdout, &id, &buffer);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pipe_stream(stderr, LogStream::Stderr, &id, &buffer);
        }

        let stdin = Arc::new(tokio::sync::Mutex::new(child.stdin.take()));
        let (term_tx, term_rx) = watch::channel(None);
        self.handles.insert(
            id.clone(),
            ChildHandle {
                pid,
                stdin,
                term_tx,
                _permit: permit,
            },
        );

        self.monitor.watch(&id, pid);

        self.events.emit(OrchEvent::WorkerSpawned {
            id: id.clone(),
            pid,
            worktree: worktree.display().to_string(),
        });
        info!(worker_id = %id, pid, branch = %branch, "Worker spawned");

        let supervisor = Arc::clone(self);
        let wait_id = id.clone();
        tokio::spawn(async move {
            supervisor.wait_loop(wait_id, child, term_rx).await;
        });

        self.registry
            .get(&id)
            .ok_or_else(|| MusterError::Internal("worker vanished after spawn".into()))
    }

    fn spawn_process(
        &self,
        request: &SpawnRequest,
        id: &str,
        worktree: &std::path::Path,
    ) -> Result<Child> {
        let program = request
            .command
            .clone()
            .unwrap_or_else(|| self.config.default_command.clone());

        let sep = if cfg!(windows) { ";" } else { ":" };
        let path = match std::env::var("PATH") {
            Ok(existing) => format!("{}{}{}", worktree.display(), sep, existing),
            Err(_) => worktree.display().to_string(),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&request.args)
            .current_dir(worktree)
            .envs(&request.env)
            .env("AGENT_ID", id)
            .env("AGENT_WORKTREE", worktree)
            .env("AGENT_ISOLATED", "1")
            .env("AGENT_ENV", "production")
            .env("PATH", path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn().map_err(|e| MusterError::Spawn(e.to_string()))
    }

    fn pipe_stream<R>(&self, reader: R, stream: LogStream, id: &str, buffer: &Arc<LogBuffer>)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        let buffer = Arc::clone(buffer);
        let id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buffer.push(stream, line.clone());
                let event = match stream {
                    LogStream::Stdout => OrchEvent::WorkerStdout {
                        id: id.clone(),
                        data: line,
                    },
                    LogStream::Stderr => OrchEvent::WorkerStderr {
                        id: id.clone(),
                        data: line,
                    },
                };
                events.emit(event);
            }
        });
    }

    async fn wait_loop(
        self: Arc<Self>,
        id: String,
        mut child: Child,
        mut term_rx: watch::Receiver<Option<TermReason>>,
    ) {
        let wall = tokio::time::sleep(Duration::from_secs(self.config.wall_clock_secs));
        tokio::pin!(wall);

        let (exit_status, reason) = loop {
            tokio::select! {
                status = child.wait() => {
                    break (status.ok(), None);
                }
                _ = &mut wall => {
                    warn!(worker_id = %id, "Wall-clock budget exhausted");
                    let _ = self.registry.update(&id, WorkerPatch::status(WorkerStatus::Terminating));
                    self.events.emit(OrchEvent::WorkerTerminating {
                        id: id.clone(),
                        reason: TermReason::Timeout.as_str().into(),
                    });
                    let status = self.kill_gracefully(&mut child).await;
                    break (status, Some(TermReason::Timeout));
                }
                changed = term_rx.changed() => {
                    if changed.is_err() {
                        // Sender gone; nothing can request termination anymore.
                        break (child.wait().await.ok(), None);
                    }
                    let requested = *term_rx.borrow();
                    if let Some(reason) = requested {
                        let status = self.kill_gracefully(&mut child).await;
                        break (status, Some(reason));
                    }
                }
            }
        };

        self.finalize(&id, exit_status, reason).await;
    }

    async fn kill_gracefully(&self, child: &mut Child) -> Option<std::process::ExitStatus> {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        let grace = Duration::from_secs(self.config.grace_period_secs);
        match timeout(grace, child.wait()).await {
            Ok(status) => status.ok(),
            Err(_) => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        }
    }

    async fn finalize(
        &self,
        id: &str,
        exit_status: Option<std::process::ExitStatus>,
        reason: Option<TermReason>,
    ) {
        self.monitor.unwatch(id);

        let exit_code = exit_status.and_then(|s| s.code());
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            exit_status.and_then(|s| s.signal())
        };
        #[cfg(not(unix))]
        let signal: Option<i32> = None;

        let success = exit_status.is_some_and(|s| s.success());
        let (status, error) = match reason {
            Some(TermReason::Timeout) => (WorkerStatus::Failed, Some("timeout".to_string())),
            Some(TermReason::MemoryLimit) => {
                (WorkerStatus::Failed, Some("memory_limit".to_string()))
            }
            Some(_) if success => (WorkerStatus::Completed, None),
            Some(reason) => (WorkerStatus::Failed, Some(reason.as_str().into())),
            None if success => (WorkerStatus::Completed, None),
            None => {
                let cause = match (exit_code, signal) {
                    (Some(code), _) => format!("exit code {code}"),
                    (None, Some(sig)) => format!("killed by signal {sig}"),
                    (None, None) => "process wait failed".to_string(),
                };
                (WorkerStatus::Failed, Some(cause))
            }
        };

        let mut patch = WorkerPatch::status(status).with_completed_at(Utc::now());
        if let Some(error) = error {
            patch = patch.with_error(error);
        }
        if let Err(e) = self.registry.update(id, patch) {
            debug!(worker_id = %id, error = %e, "Exit for unknown worker");
        }
        self.handles.remove(id);

        self.events.emit(OrchEvent::WorkerExit {
            id: id.to_string(),
            exit_code,
            signal,
        });
        info!(worker_id = %id, ?exit_code, ?signal, "Worker exited");

        // Termination reclaims the working copy; a natural exit keeps it
        // for consolidation.
        if reason.is_some()
            && let Some(worker) = self.registry.get(id)
            && let Err(e) = self
                .vcs
                .worktree_remove(&worker.project, &worker.worktree_path)
                .await
        {
            warn!(worker_id = %id, error = %e, "Worktree removal after termination failed");
            self.events.emit(OrchEvent::WorkerError {
                id: id.to_string(),
                error: e.to_string(),
            });
        }
    }

    /// Request termination. The first call for a live worker succeeds; any
    /// later call reports `not_found` with no further side effects.
    pub fn terminate(&self, id: &str, reason: TermReason) -> Result<()> {
        let handle = self
            .handles
            .get(id)
            .ok_or_else(|| MusterError::NotFound(format!("worker {id}")))?;
        if self
            .registry
            .get(id)
            .is_some_and(|w| w.status.is_terminal())
        {
            return Err(MusterError::NotFound(format!("worker {id}")));
        }

        let _ = self
            .registry
            .update(id, WorkerPatch::status(WorkerStatus::Terminating));
        self.events.emit(OrchEvent::WorkerTerminating {
            id: id.to_string(),
            reason: reason.as_str().into(),
        });
        let _ = handle.term_tx.send(Some(reason));
        Ok(())
    }

    /// Write a payload line to the child's stdin. Strings pass through
    /// verbatim; other shapes are serialized as JSON.
    pub async fn send(&self, id: &str, payload: &serde_json::Value) -> Result<()> {
        let stdin = {
            let handle = self
                .handles
                .get(id)
                .ok_or_else(|| MusterError::NotFound(format!("worker {id}")))?;
            Arc::clone(&handle.stdin)
        };

        let line = match payload {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };

        let mut guard = stdin.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| MusterError::NoStdin(id.to_string()))?;
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MusterError::Delivery(e.to_string()))?;
        stream
            .write_all(b"\n")
            .await
            .map_err(|e| MusterError::Delivery(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| MusterError::Delivery(e.to_string()))?;
        Ok(())
    }

    pub fn logs(&self, id: &str, offset: usize, count: usize) -> Result<(Vec<LogLine>, usize)> {
        if let Some(buffer) = self.logs.get(id) {
            return Ok(buffer.page(offset, count));
        }
        if self.registry.get(id).is_some() {
            return Ok((Vec::new(), 0));
        }
        Err(MusterError::NotFound(format!("worker {id}")))
    }

    /// Terminate every live worker and wait for the reapers to finish.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        info!(count = ids.len(), "Terminating all workers for shutdown");
        for id in &ids {
            let _ = self.terminate(id, TermReason::Shutdown);
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.grace_period_secs + 10);
        while !self.handles.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn pid_of(&self, id: &str) -> Option<u32> {
        self.handles.get(id).map(|h| h.pid)
    }
}
