use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::Worker;
use crate::error::Result;

/// Durable mirror of the registry: a single JSON array of worker records,
/// written with temp-file + atomic rename.
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, workers: &[Worker]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(workers)?;
        let tmp_path = self.path.with_extension("json.tmp");

        fs::write(&tmp_path, &content).await?;

        // fsync before the rename so a crash cannot leave a truncated mirror
        let tmp_clone = tmp_path.clone();
        let sync_result = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&tmp_clone).and_then(|file| file.sync_all())
        })
        .await;
        match sync_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to sync registry temp file"),
            Err(e) => warn!(error = %e, "Registry sync task failed"),
        }

        fs::rename(&tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), count = workers.len(), "Registry mirrored to disk");
        Ok(())
    }

    /// Load the mirror. A missing or corrupt file yields an empty list so a
    /// bad mirror never takes the engine down.
    pub async fn load(&self) -> Vec<Worker> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read registry file");
                return Vec::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(workers) => workers,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Registry file is corrupt, starting from an empty index"
                );
                Vec::new()
            }
        }
    }
}
