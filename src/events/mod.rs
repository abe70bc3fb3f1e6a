//! Local event fabric: typed publish/subscribe for lifecycle and
//! coordination events.
//!
//! Events are observation, not control — no subsystem may depend on a
//! subscriber running for correctness.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Snapshot of a message carried on bus events, decoupled from the bus
/// module so the event fabric stays a leaf dependency.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEventSnapshot {
    pub id: String,
    pub kind: String,
    pub source: String,
    pub target: String,
    pub status: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchEvent {
    WorkerSpawning {
        id: String,
        name: String,
        worktree: String,
    },
    WorkerSpawned {
        id: String,
        pid: u32,
        worktree: String,
    },
    WorkerSpawnFailed {
        id: Option<String>,
        error: String,
    },
    WorkerStatusChanged {
        id: String,
        old: String,
        new: String,
    },
    /// Companion to `WorkerStatusChanged` whose topic names the transition
    /// itself, so subscribers can filter on `worker:transition:a:b` without
    /// parsing payloads.
    WorkerTransition {
        id: String,
        old: String,
        new: String,
    },
    WorkerExit {
        id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    WorkerStdout {
        id: String,
        data: String,
    },
    WorkerStderr {
        id: String,
        data: String,
    },
    WorkerTerminating {
        id: String,
        reason: String,
    },
    WorkerError {
        id: String,
        error: String,
    },
    WorkerRegistered {
        id: String,
    },
    WorkerUpdated {
        id: String,
    },
    WorkerUnregistered {
        id: String,
    },
    MessageQueued {
        message: MessageEventSnapshot,
    },
    MessageDelivering {
        message: MessageEventSnapshot,
    },
    MessageDelivered {
        message: MessageEventSnapshot,
    },
    MessageFailed {
        message: MessageEventSnapshot,
        error: String,
    },
    BarrierSignal {
        id: String,
        worker: String,
        arrived: Vec<String>,
    },
    BarrierComplete {
        id: String,
        arrived: Vec<String>,
    },
    BarrierTimeout {
        id: String,
        arrived: Vec<String>,
    },
    ElectionInProgress {
        id: String,
        candidates: Vec<String>,
    },
    ElectionCompleted {
        id: String,
        winner: Option<String>,
        votes: HashMap<String, usize>,
    },
    ElectionTimeout {
        id: String,
        winner: Option<String>,
        votes: HashMap<String, usize>,
    },
    ConsolidationAnalyzing {
        id: String,
    },
    ConsolidationAnalyzed {
        id: String,
        total_files: usize,
        conflicts: usize,
    },
    ConsolidationReady {
        id: String,
        planned_files: usize,
    },
    ConsolidationCompleted {
        id: String,
        merged: usize,
        commit: Option<String>,
    },
    ConsolidationFailed {
        id: String,
        error: String,
    },
}

impl OrchEvent {
    /// Stable topic string for subscriber-side filtering. Status
    /// transitions carry the old and new state in the topic so listeners
    /// never parse payloads for routing.
    pub fn topic(&self) -> String {
        match self {
            Self::WorkerSpawning { .. } => "worker:spawning".into(),
            Self::WorkerSpawned { .. } => "worker:spawned".into(),
            Self::WorkerSpawnFailed { .. } => "worker:spawn_failed".into(),
            Self::WorkerStatusChanged { .. } => "worker:status_changed".into(),
            Self::WorkerTransition { old, new, .. } => {
                format!("worker:transition:{old}:{new}")
            }
            Self::WorkerExit { .. } => "worker:exit".into(),
            Self::WorkerStdout { .. } => "worker:stdout".into(),
            Self::WorkerStderr { .. } => "worker:stderr".into(),
            Self::WorkerTerminating { .. } => "worker:terminating".into(),
            Self::WorkerError { .. } => "worker:error".into(),
            Self::WorkerRegistered { .. } => "worker:registered".into(),
            Self::WorkerUpdated { .. } => "worker:updated".into(),
            Self::WorkerUnregistered { .. } => "worker:unregistered".into(),
            Self::MessageQueued { .. } => "message:queued".into(),
            Self::MessageDelivering { .. } => "message:delivering".into(),
            Self::MessageDelivered { .. } => "message:delivered".into(),
            Self::MessageFailed { .. } => "message:failed".into(),
            Self::BarrierSignal { .. } => "barrier:signal".into(),
            Self::BarrierComplete { .. } => "barrier:complete".into(),
            Self::BarrierTimeout { .. } => "barrier:timeout".into(),
            Self::ElectionInProgress { .. } => "election:in_progress".into(),
            Self::ElectionCompleted { .. } => "election:completed".into(),
            Self::ElectionTimeout { .. } => "election:timeout".into(),
            Self::ConsolidationAnalyzing { .. } => "consolidation:analyzing".into(),
            Self::ConsolidationAnalyzed { .. } => "consolidation:analyzed".into(),
            Self::ConsolidationReady { .. } => "consolidation:ready".into(),
            Self::ConsolidationCompleted { .. } => "consolidation:completed".into(),
            Self::ConsolidationFailed { .. } => "consolidation:failed".into(),
        }
    }
}

/// Broadcast fabric shared by every subsystem. Cloning is cheap; all
/// clones feed the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Delivery is best-effort: with no subscribers the
    /// event is dropped, which is fine because events are observation only.
    pub fn emit(&self, event: OrchEvent) {
        trace!(topic = %event.topic(), "Event emitted");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
