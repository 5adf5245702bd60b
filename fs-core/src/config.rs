//! Runtime configuration: table capacities and cache sizing

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for loading or validating a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Capacities of the in-memory tables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Cached-inode arena capacity
    pub inode_cache_slots: usize,
    /// Shared open-file pool capacity
    pub open_file_slots: usize,
    /// Descriptor table size of each process
    pub descriptors_per_process: usize,
    /// Number of simulated processes
    pub processes: usize,
    /// Mount table capacity (the root device uses one slot)
    pub mount_table_slots: usize,
    /// Maximum number of path components
    pub max_path_depth: usize,
    /// Blocks kept by each device's LRU block cache
    pub block_cache_blocks: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            inode_cache_slots: 100,
            open_file_slots: 32,
            descriptors_per_process: 16,
            processes: 4,
            mount_table_slots: 8,
            max_path_depth: 20,
            block_cache_blocks: 256,
        }
    }
}

impl FsConfig {
    /// Load a configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: FsConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject capacities the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("inode_cache_slots", self.inode_cache_slots),
            ("open_file_slots", self.open_file_slots),
            ("descriptors_per_process", self.descriptors_per_process),
            ("processes", self.processes),
            ("mount_table_slots", self.mount_table_slots),
            ("max_path_depth", self.max_path_depth),
            ("block_cache_blocks", self.block_cache_blocks),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        // Every process pins its working directory in the inode cache.
        if self.inode_cache_slots <= self.processes {
            return Err(ConfigError::Invalid(format!(
                "inode_cache_slots ({}) must exceed processes ({})",
                self.inode_cache_slots, self.processes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fs.json");
        std::fs::write(&path, r#"{ "processes": 2, "max_path_depth": 8 }"#).unwrap();

        let config = FsConfig::from_json_file(&path).unwrap();
        assert_eq!(config.processes, 2);
        assert_eq!(config.max_path_depth, 8);
        assert_eq!(config.inode_cache_slots, FsConfig::default().inode_cache_slots);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = FsConfig { open_file_slots: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = FsConfig { inode_cache_slots: 4, processes: 4, ..Default::default() };
        assert!(config.validate().is_err());
        assert!(FsConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ processes: ").unwrap();
        assert!(matches!(FsConfig::from_json_file(&path), Err(ConfigError::Parse(_))));
    }
}
