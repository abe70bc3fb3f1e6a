use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, warn};

use super::Consolidation;
use crate::error::Result;

/// Consolidation records in a single JSON array, with the same atomic
/// rename discipline as the registry mirror and a short-TTL read cache.
pub struct ConsolidationStore {
    path: PathBuf,
    cache: Mutex<Option<(Instant, Vec<Consolidation>)>>,
    ttl: Duration,
}

impl ConsolidationStore {
    pub fn new(path: PathBuf, ttl: Duration) -> Self {
        Self {
            path,
            cache: Mutex::new(None),
            ttl,
        }
    }

    pub async fn load(&self) -> Vec<Consolidation> {
        {
            let cache = self.cache.lock();
            if let Some((at, records)) = cache.as_ref()
                && at.elapsed() < self.ttl
            {
                return records.clone();
            }
        }

        let records = self.load_uncached().await;
        *self.cache.lock() = Some((Instant::now(), records.clone()));
        records
    }

    async fn load_uncached(&self) -> Vec<Consolidation> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read consolidations");
                return Vec::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Consolidations file is corrupt, starting empty"
                );
                Vec::new()
            }
        }
    }

    pub async fn save(&self, records: &[Consolidation]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &self.path).await?;

        *self.cache.lock() = Some((Instant::now(), records.to_vec()));
        debug!(count = records.len(), "Consolidations persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidationStore::new(
            dir.path().join("consolidations.json"),
            Duration::from_secs(5),
        );

        let record = Consolidation::new("c-1", "/repo", "main", vec!["w-1".into()]);
        store.save(&[record]).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "c-1");
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ConsolidationStore::new(
            dir.path().join("consolidations.json"),
            Duration::from_secs(5),
        );
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("consolidations.json");
        let store = ConsolidationStore::new(path.clone(), Duration::from_secs(60));

        store
            .save(&[Consolidation::new("c-1", "/repo", "main", vec![])])
            .await
            .unwrap();

        // Clobber the file behind the store's back; the cache still serves
        // the saved snapshot.
        tokio::fs::write(&path, "[]").await.unwrap();
        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
    }
}
