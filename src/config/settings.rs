use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{MusterError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchConfig {
    pub supervisor: SupervisorConfig,
    pub monitor: MonitorConfig,
    pub bus: BusConfig,
    pub registry: RegistryConfig,
    pub consolidation: ConsolidationConfig,
    pub server: ServerConfig,
}

impl OrchConfig {
    pub async fn load(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join("config.toml");
        let config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, state_dir: &Path) -> Result<()> {
        self.validate()?;
        let config_path = state_dir.join("config.toml");
        let content =
            toml::to_string_pretty(self).map_err(|e| MusterError::Config(e.to_string()))?;
        fs::write(&config_path, content).await?;
        Ok(())
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.supervisor.max_active_workers == 0 {
            errors.push("supervisor.max_active_workers must be greater than 0");
        }
        if self.supervisor.wall_clock_secs == 0 {
            errors.push("supervisor.wall_clock_secs must be greater than 0");
        }
        if self.supervisor.worktree_root.is_empty() {
            errors.push("supervisor.worktree_root must not be empty");
        }
        if self.supervisor.branch_prefix.is_empty() {
            errors.push("supervisor.branch_prefix must not be empty");
        }

        if self.monitor.sample_interval_secs == 0 {
            errors.push("monitor.sample_interval_secs must be greater than 0");
        }
        if self.monitor.memory_limit_mb == 0 {
            errors.push("monitor.memory_limit_mb must be greater than 0");
        }
        if self.monitor.sample_window == 0 {
            errors.push("monitor.sample_window must be greater than 0");
        }

        if self.bus.queue_capacity == 0 {
            errors.push("bus.queue_capacity must be greater than 0");
        }
        if self.bus.retry_base_ms == 0 {
            errors.push("bus.retry_base_ms must be greater than 0");
        }

        if self.registry.max_records == 0 {
            errors.push("registry.max_records must be greater than 0");
        }

        if self.server.bind.is_empty() {
            errors.push("server.bind must not be empty");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MusterError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Host-wide cap on concurrently active workers.
    pub max_active_workers: usize,
    /// Wall-clock budget per worker before forced termination.
    pub wall_clock_secs: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub grace_period_secs: u64,
    /// Worktree root relative to the project, one subdirectory per worker.
    pub worktree_root: String,
    /// Prefix for generated worker branches.
    pub branch_prefix: String,
    /// Program to run when a spawn request carries no command.
    pub default_command: String,
    /// Maximum buffered log lines per worker.
    pub log_buffer_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_active_workers: 10,
            wall_clock_secs: 30 * 60,
            grace_period_secs: 5,
            worktree_root: ".orch/worktrees".into(),
            branch_prefix: "agent".into(),
            default_command: "claude".into(),
            log_buffer_lines: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sample_interval_secs: u64,
    pub memory_limit_mb: u64,
    /// Rolling window of retained samples per worker.
    pub sample_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            memory_limit_mb: 512,
            sample_window: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            max_retries: 3,
            retry_base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Ceiling that triggers pruning of old terminal records.
    pub max_records: usize,
    pub terminal_retention_hours: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_records: 1000,
            terminal_retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub cache_ttl_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7620".into(),
        }
    }
}

/// Filesystem layout for durable orchestrator state.
#[derive(Debug, Clone)]
pub struct OrchPaths {
    pub state_dir: PathBuf,
    pub registry_file: PathBuf,
    pub messages_dir: PathBuf,
    pub consolidations_file: PathBuf,
    worktree_root: String,
}

impl OrchPaths {
    pub fn new(state_dir: PathBuf, config: &OrchConfig) -> Self {
        Self {
            registry_file: state_dir.join("registry.json"),
            messages_dir: state_dir.join("messages"),
            consolidations_file: state_dir.join("consolidations.json"),
            worktree_root: config.supervisor.worktree_root.clone(),
            state_dir,
        }
    }

    /// Default per-user state directory (`$HOME/.config/orchestrator`).
    pub fn default_state_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("orchestrator")
    }

    /// Worktree root for a given project, one subdirectory per worker.
    pub fn project_worktrees(&self, project: &Path) -> PathBuf {
        project.join(&self.worktree_root)
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        fs::create_dir_all(&self.messages_dir).await?;
        Ok(())
    }

    /// Remove `.tmp` leftovers from interrupted atomic writes.
    pub async fn recover_interrupted_writes(&self) {
        for dir in [&self.state_dir, &self.messages_dir] {
            if let Ok(mut entries) = fs::read_dir(dir).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "tmp") {
                        tracing::debug!(path = %path.display(), "Removing interrupted write");
                        let _ = fs::remove_file(&path).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.supervisor.max_active_workers, 10);
        assert_eq!(config.monitor.memory_limit_mb, 512);
        assert_eq!(config.bus.queue_capacity, 1000);
    }

    #[test]
    fn test_validation_collects_violations() {
        let mut config = OrchConfig::default();
        config.supervisor.max_active_workers = 0;
        config.bus.queue_capacity = 0;

        let err = config.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("max_active_workers"));
        assert!(msg.contains("queue_capacity"));
    }

    #[test]
    fn test_paths_layout() {
        let config = OrchConfig::default();
        let paths = OrchPaths::new(PathBuf::from("/tmp/state"), &config);

        assert_eq!(paths.registry_file, PathBuf::from("/tmp/state/registry.json"));
        assert_eq!(paths.messages_dir, PathBuf::from("/tmp/state/messages"));
        assert_eq!(
            paths.project_worktrees(Path::new("/repo")),
            PathBuf::from("/repo/.orch/worktrees")
        );
    }

    #[tokio::test]
    async fn test_config_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = OrchConfig::default();
        config.save(dir.path()).await.unwrap();

        let loaded = OrchConfig::load(dir.path()).await.unwrap();
        assert_eq!(
            loaded.supervisor.max_active_workers,
            config.supervisor.max_active_workers
        );
        assert_eq!(loaded.server.bind, config.server.bind);
    }
}
