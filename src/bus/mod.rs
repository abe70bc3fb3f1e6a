//! Priority message bus with at-least-once delivery.
//!
//! Every worker (optionally scoped by worktree) has a bounded queue sorted
//! by priority then enqueue order. Each message is durable as its own JSON
//! file until it reaches a terminal state. A single drain task attempts
//! delivery through a pluggable sink and retries with exponential backoff.

mod message;
mod store;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::error::{MusterError, Result};
use crate::events::{EventBus, OrchEvent};
use crate::registry::{Registry, WorkerStatus};
use crate::supervisor::WorkerSupervisor;

pub use message::{Message, MessagePriority, MessageStatus, QueueKey};
pub use store::MessageStore;

/// Pluggable delivery. The engine's default sink forwards to the child
/// process over stdin; subscribers that deliver asynchronously report back
/// through [`MessageBus::mark_delivered`] / [`MessageBus::mark_failed`].
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, message: &Message) -> Result<()>;
}

/// Default sink: write the message envelope to the worker's stdin.
pub struct SupervisorSink {
    supervisor: Arc<WorkerSupervisor>,
}

impl SupervisorSink {
    pub fn new(supervisor: Arc<WorkerSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl DeliverySink for SupervisorSink {
    async fn deliver(&self, message: &Message) -> Result<()> {
        let envelope = serde_json::json!({
            "id": message.id,
            "kind": message.kind,
            "source": message.source,
            "payload": message.payload,
        });
        self.supervisor.send(&message.target, &envelope).await
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueReport {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_kind: HashMap<String, usize>,
}

pub struct MessageBus {
    config: BusConfig,
    queues: Arc<DashMap<QueueKey, Vec<Message>>>,
    store: MessageStore,
    events: EventBus,
    registry: Arc<Registry>,
    sink: Arc<dyn DeliverySink>,
    drain_notify: Arc<Notify>,
    seq: AtomicU64,
    drain_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(
        config: BusConfig,
        store: MessageStore,
        registry: Arc<Registry>,
        sink: Arc<dyn DeliverySink>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            queues: Arc::new(DashMap::new()),
            store,
            events,
            registry,
            sink,
            drain_notify: Arc::new(Notify::new()),
            seq: AtomicU64::new(1),
            drain_task: parking_lot::Mutex::new(None),
        }
    }

    /// Load non-terminal messages from disk back into their queues.
    /// In-flight retries restart as pending; their timers did not survive.
    pub async fn rehydrate(&self) -> Result<usize> {
        let messages = self.store.load_all().await?;
        let count = messages.len();
        for mut message in messages {
            if message.status == MessageStatus::Retrying {
                message.status = MessageStatus::Pending;
            }
            message.seq = self.seq.fetch_add(1, Ordering::SeqCst);
            let key = message.queue_key();
            let mut queue = self.queues.entry(key).or_default();
            queue.push(message);
            queue.sort_by_key(|m| (m.priority, m.seq));
        }
        if count > 0 {
            info!(count, "Rehydrated durable messages");
            self.drain_notify.notify_one();
        }
        Ok(count)
    }

    /// Start the drain loop.
    pub fn start(self: &Arc<Self>) {
        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let progressed = bus.drain_pass().await;
                if !progressed {
                    bus.drain_notify.notified().await;
                }
            }
        });
        *self.drain_task.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.drain_task.lock().take() {
            handle.abort();
        }
    }

    /// Queue a message. The durable record is written before `queued` is
    /// emitted, so observers never see a message that could vanish on crash.
    pub async fn send(&self, mut message: Message) -> Result<Message> {
        if message.target.trim().is_empty() {
            return Err(MusterError::Validation("message target is required".into()));
        }

        let key = message.queue_key();
        let current_len = self.queues.get(&key).map(|q| q.len()).unwrap_or(0);
        if current_len >= self.config.queue_capacity {
            return Err(MusterError::QueueFull {
                key: key.to_string(),
                capacity: self.config.queue_capacity,
            });
        }

        message.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        message.status = MessageStatus::Pending;

        if let Err(e) = self.store.persist(&message).await {
            warn!(message_id = %message.id, error = %e, "Message persistence failed");
        }

        {
            let mut queue = self.queues.entry(key).or_default();
            queue.push(message.clone());
            queue.sort_by_key(|m| (m.priority, m.seq));
        }

        self.events.emit(OrchEvent::MessageQueued {
            message: message.snapshot(),
        });
        self.drain_notify.notify_one();
        Ok(message)
    }

    /// Send the same payload to every matching worker: all active ones, or
    /// those under a worktree scope, minus explicit exclusions and the
    /// sender itself.
    pub async fn broadcast(
        &self,
        kind: &str,
        source: &str,
        payload: serde_json::Value,
        worktree: Option<&str>,
        exclude: &[String],
        priority: MessagePriority,
    ) -> Vec<Message> {
        let candidates = match worktree {
            Some(worktree) => self.registry.by_worktree_prefix(Path::new(worktree)),
            None => self.registry.by_status(WorkerStatus::Active),
        };

        let mut queued = Vec::new();
        for worker in candidates {
            if worker.id == source || exclude.contains(&worker.id) {
                continue;
            }
            let mut message =
                Message::new(kind, source, &worker.id, payload.clone()).with_priority(priority);
            if let Some(worktree) = worktree {
                message = message.with_worktree(worktree);
            }
            match self.send(message).await {
                Ok(message) => queued.push(message),
                Err(e) => warn!(target = %worker.id, error = %e, "Broadcast send failed"),
            }
        }
        queued
    }

    /// One pass over every non-empty queue. Returns whether any queue made
    /// progress; the drain loop parks when a full pass is idle.
    async fn drain_pass(&self) -> bool {
        let keys: Vec<QueueKey> = self.queues.iter().map(|e| e.key().clone()).collect();
        let mut progressed = false;

        for key in keys {
            loop {
                let head = self
                    .queues
                    .get(&key)
                    .and_then(|q| q.first().cloned());
                let Some(message) = head else { break };

                if message.status.is_terminal() {
                    self.pop_head(&key, &message.id);
                    progressed = true;
                    continue;
                }
                if message.status == MessageStatus::Retrying {
                    // Head is waiting on its backoff timer; this queue is
                    // parked but others keep draining.
                    break;
                }

                if let Some(timeout_ms) = message.timeout_ms {
                    let age = Utc::now().signed_duration_since(message.created_at);
                    if age.num_milliseconds() >= 0 && age.num_milliseconds() as u64 > timeout_ms {
                        self.complete_failed(&key, message, "timeout".into()).await;
                        progressed = true;
                        continue;
                    }
                }

                self.events.emit(OrchEvent::MessageDelivering {
                    message: message.snapshot(),
                });

                match self.sink.deliver(&message).await {
                    Ok(()) => {
                        self.complete_delivered(&key, message).await;
                        progressed = true;
                    }
                    Err(e) if message.retry_count < self.config.max_retries => {
                        self.schedule_retry(&key, message, e.to_string()).await;
                        progressed = true;
                        break;
                    }
                    Err(e) => {
                        self.complete_failed(&key, message, format!("max retries: {e}"))
                            .await;
                        progressed = true;
                    }
                }
            }
        }

        progressed
    }

    async fn complete_delivered(&self, key: &QueueKey, mut message: Message) {
        message.status = MessageStatus::Delivered;
        message.delivered_at = Some(Utc::now());
        self.store.remove(&message.id).await;
        self.pop_head(key, &message.id);
        debug!(message_id = %message.id, target = %message.target, "Message delivered");
        self.events.emit(OrchEvent::MessageDelivered {
            message: message.snapshot(),
        });
    }

    async fn complete_failed(&self, key: &QueueKey, mut message: Message, error: String) {
        message.status = MessageStatus::Failed;
        message.failed_at = Some(Utc::now());
        message.error = Some(error.clone());
        self.store.remove(&message.id).await;
        self.pop_head(key, &message.id);
        warn!(message_id = %message.id, target = %message.target, error = %error, "Message failed");
        self.events.emit(OrchEvent::MessageFailed {
            message: message.snapshot(),
            error,
        });
    }

    async fn schedule_retry(&self, key: &QueueKey, message: Message, error: String) {
        let delay_ms = self.config.retry_base_ms * (1 << message.retry_count);

        let updated = self.mutate(key, &message.id, |m| {
            m.status = MessageStatus::Retrying;
            m.retry_count += 1;
            m.error = Some(error.clone());
        });
        let Some(updated) = updated else { return };

        if let Err(e) = self.store.persist(&updated).await {
            warn!(message_id = %updated.id, error = %e, "Retry persistence failed");
        }
        debug!(
            message_id = %updated.id,
            retry = updated.retry_count,
            delay_ms,
            "Delivery failed, retry scheduled"
        );

        let queues_key = key.clone();
        let id = updated.id.clone();
        let notify = Arc::clone(&self.drain_notify);
        let bus_queues = Arc::clone(&self.queues);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(mut queue) = bus_queues.get_mut(&queues_key)
                && let Some(m) = queue.iter_mut().find(|m| m.id == id)
                && m.status == MessageStatus::Retrying
            {
                m.status = MessageStatus::Pending;
            }
            notify.notify_one();
        });
    }

    /// Report a delivery outcome out of band (for asynchronous sinks).
    pub async fn mark_delivered(&self, id: &str) -> Result<()> {
        let key = self
            .find_key(id)
            .ok_or_else(|| MusterError::NotFound(format!("message {id}")))?;
        let message = self
            .take_message(&key, id)
            .ok_or_else(|| MusterError::NotFound(format!("message {id}")))?;
        self.complete_delivered_unqueued(message).await;
        Ok(())
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let key = self
            .find_key(id)
            .ok_or_else(|| MusterError::NotFound(format!("message {id}")))?;
        let mut message = self
            .take_message(&key, id)
            .ok_or_else(|| MusterError::NotFound(format!("message {id}")))?;
        message.status = MessageStatus::Failed;
        message.failed_at = Some(Utc::now());
        message.error = Some(error.to_string());
        self.store.remove(&message.id).await;
        self.events.emit(OrchEvent::MessageFailed {
            message: message.snapshot(),
            error: error.to_string(),
        });
        Ok(())
    }

    async fn complete_delivered_unqueued(&self, mut message: Message) {
        message.status = MessageStatus::Delivered;
        message.delivered_at = Some(Utc::now());
        self.store.remove(&message.id).await;
        self.events.emit(OrchEvent::MessageDelivered {
            message: message.snapshot(),
        });
    }

    /// Counts by status and kind for one worker's queues or all of them.
    pub fn queue_report(&self, worker: Option<&str>) -> QueueReport {
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut total = 0;

        for entry in self.queues.iter() {
            if let Some(worker) = worker
                && entry.key().target != worker
            {
                continue;
            }
            for message in entry.value() {
                total += 1;
                *by_status
                    .entry(message.status.as_str().to_string())
                    .or_default() += 1;
                *by_kind.entry(message.kind.clone()).or_default() += 1;
            }
        }

        QueueReport {
            total,
            by_status,
            by_kind,
        }
    }

    pub fn queued_count(&self, key: &QueueKey) -> usize {
        self.queues.get(key).map(|q| q.len()).unwrap_or(0)
    }

    fn pop_head(&self, key: &QueueKey, id: &str) {
        let mut empty = false;
        if let Some(mut queue) = self.queues.get_mut(key) {
            if queue.first().is_some_and(|m| m.id == id) {
                queue.remove(0);
            }
            empty = queue.is_empty();
        }
        if empty {
            self.queues.remove_if(key, |_, q| q.is_empty());
        }
    }

    fn mutate(
        &self,
        key: &QueueKey,
        id: &str,
        f: impl FnOnce(&mut Message),
    ) -> Option<Message> {
        let mut queue = self.queues.get_mut(key)?;
        let message = queue.iter_mut().find(|m| m.id == id)?;
        f(message);
        Some(message.clone())
    }

    fn find_key(&self, id: &str) -> Option<QueueKey> {
        self.queues
            .iter()
            .find(|entry| entry.value().iter().any(|m| m.id == id))
            .map(|entry| entry.key().clone())
    }

    fn take_message(&self, key: &QueueKey, id: &str) -> Option<Message> {
        let mut queue = self.queues.get_mut(key)?;
        let pos = queue.iter().position(|m| m.id == id)?;
        Some(queue.remove(pos))
    }
}
