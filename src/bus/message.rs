use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::MessageEventSnapshot;

/// Numerically smaller priorities drain first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
    Retrying,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// Durable inter-worker message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: String,
    /// Sending worker id, or `"orchestrator"`.
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    pub payload: serde_json::Value,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Enqueue order within a priority level. Volatile; reassigned on
    /// rehydration.
    #[serde(skip)]
    pub seq: u64,
}

impl Message {
    pub fn new(
        kind: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            source: source.into(),
            target: target.into(),
            worktree: None,
            payload,
            priority: MessagePriority::Normal,
            status: MessageStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            delivered_at: None,
            failed_at: None,
            error: None,
            timeout_ms: None,
            metadata: HashMap::new(),
            seq: 0,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_worktree(mut self, worktree: impl Into<String>) -> Self {
        self.worktree = Some(worktree.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn queue_key(&self) -> QueueKey {
        QueueKey {
            worktree: self.worktree.clone(),
            target: self.target.clone(),
        }
    }

    pub fn snapshot(&self) -> MessageEventSnapshot {
        MessageEventSnapshot {
            id: self.id.clone(),
            kind: self.kind.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            status: self.status.as_str().into(),
            retry_count: self.retry_count,
        }
    }
}

/// Queue identity: target worker plus an optional worktree scope. Messages
/// without a worktree land in the target's default bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub worktree: Option<String>,
    pub target: String,
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.worktree {
            Some(worktree) => write!(f, "{}/{}", worktree, self.target),
            None => write!(f, "default/{}", self.target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(MessagePriority::Critical < MessagePriority::High);
        assert!(MessagePriority::High < MessagePriority::Normal);
        assert!(MessagePriority::Normal < MessagePriority::Low);
    }

    #[test]
    fn test_message_defaults() {
        let msg = Message::new("task", "orchestrator", "w-1", serde_json::json!({"n": 1}));
        assert_eq!(msg.priority, MessagePriority::Normal);
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retry_count, 0);
        assert!(!msg.id.is_empty());
    }

    #[test]
    fn test_queue_key_buckets() {
        let default = Message::new("k", "s", "w-1", serde_json::Value::Null);
        let scoped = Message::new("k", "s", "w-1", serde_json::Value::Null).with_worktree("/wt");

        assert_ne!(default.queue_key(), scoped.queue_key());
        assert_eq!(default.queue_key().to_string(), "default/w-1");
        assert_eq!(scoped.queue_key().to_string(), "/wt/w-1");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(MessageStatus::Delivered.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Retrying.is_terminal());
    }
}
