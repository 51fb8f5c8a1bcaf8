use anyhow::Result;
use query_distributed::ExecutorConfig;
use query_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub server: ServerConfig,
    /// Keep snapshots on disk under this directory instead of in memory
    pub snapshot_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qe.json");

        let mut config = Config::default();
        config.server = config.server.with_bind_address("0.0.0.0:9090");
        config.executor = config.executor.with_max_concurrent_tasks(8);
        config.snapshot_dir = Some(dir.path().join("snapshots"));
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.server.bind_address, "0.0.0.0:9090");
        assert_eq!(loaded.executor.max_concurrent_tasks, 8);
        assert_eq!(loaded.snapshot_dir, config.snapshot_dir);
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = serde_json::from_str(r#"{"server": {"bind_address": "127.0.0.1:1", "max_wait_ms": 500, "default_target_result_size": 1, "max_target_result_size": 2, "purge_interval_ms": 200, "query_retention_ms": 10}}"#).unwrap();
        assert_eq!(config.server.max_wait_ms, 500);
        assert_eq!(config.executor.max_concurrent_tasks, 64);
        assert!(config.snapshot_dir.is_none());
    }
}
