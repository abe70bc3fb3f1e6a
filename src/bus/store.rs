use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::message::Message;
use crate::error::Result;

/// One JSON file per non-terminal message. Terminal transitions delete the
/// file; leftovers found at startup are reaped.
pub struct MessageStore {
    dir: PathBuf,
}

impl MessageStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn persist(&self, message: &Message) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&message.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(message)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) {
        let path = self.path_for(id);
        if let Err(e) = fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(message_id = %id, error = %e, "Failed to remove durable message");
        }
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.path_for(id).exists()
    }

    /// Rehydrate all non-terminal messages; delete terminal files left over
    /// from a previous run.
    pub async fn load_all(&self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(messages),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<Message>(&content) {
                Ok(message) if message.status.is_terminal() => {
                    debug!(message_id = %message.id, "Removing terminal message file");
                    let _ = fs::remove_file(&path).await;
                }
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping corrupt message file");
                }
            }
        }

        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::MessageStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(dir.path().join("messages"));

        let msg = Message::new("task", "orchestrator", "w-1", serde_json::json!("hi"));
        store.persist(&msg).await.unwrap();
        assert!(store.exists(&msg.id).await);

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, msg.id);
    }

    #[tokio::test]
    async fn test_load_reaps_terminal_files() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(dir.path().join("messages"));

        let mut delivered = Message::new("task", "s", "w-1", serde_json::Value::Null);
        delivered.status = MessageStatus::Delivered;
        store.persist(&delivered).await.unwrap();

        let pending = Message::new("task", "s", "w-1", serde_json::Value::Null);
        store.persist(&pending).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, pending.id);
        assert!(!store.exists(&delivered.id).await);
    }

    #[tokio::test]
    async fn test_remove_missing_is_silent() {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(dir.path().join("messages"));
        store.remove("does-not-exist").await;
    }
}
