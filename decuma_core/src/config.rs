//! Storage engine configuration, loaded from TOML.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Tunables for one [`crate::database::Database`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding the register log and segment files.
    pub data_dir: PathBuf,
    /// A segment is split once its `memory_consumption` (resident byte
    /// size) exceeds this.
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: usize,
    /// Resident-segment cap enforced by the memory manager.
    #[serde(default = "default_max_segments_in_memory")]
    pub max_segments_in_memory: usize,
    /// Number of pieces an overflowing segment is split into.
    #[serde(default = "default_n_splits")]
    pub n_splits: usize,
}

fn default_max_segment_size() -> usize {
    100_000
}

fn default_max_segments_in_memory() -> usize {
    256
}

fn default_n_splits() -> usize {
    2
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> StorageResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| StorageError::IoFailure {
            path: path.display().to_string(),
            source,
        })?;
        let config: EngineConfig = toml::from_str(&text).map_err(|e| StorageError::InvalidArgument {
            what: format!("malformed config at {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.max_segment_size == 0 {
            return Err(StorageError::InvalidArgument {
                what: "max_segment_size must be greater than zero".to_string(),
            });
        }
        if self.max_segments_in_memory == 0 {
            return Err(StorageError::InvalidArgument {
                what: "max_segments_in_memory must be greater than zero".to_string(),
            });
        }
        if self.n_splits < 2 {
            return Err(StorageError::InvalidArgument {
                what: "n_splits must be at least 2".to_string(),
            });
        }
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.data_dir).map_err(|source| StorageError::IoFailure {
            path: self.data_dir.display().to_string(),
            source,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_dir: PathBuf::from("./data"),
            max_segment_size: default_max_segment_size(),
            max_segments_in_memory: default_max_segments_in_memory(),
            n_splits: default_n_splits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_max_segment_size() {
        let mut cfg = EngineConfig::default();
        cfg.max_segment_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_fewer_than_two_splits() {
        let mut cfg = EngineConfig::default();
        cfg.n_splits = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_parses_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decuma.toml");
        fs::write(&path, "data_dir = \"/tmp/decuma-data\"\n").unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.max_segment_size, default_max_segment_size());
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/decuma-data"));
    }
}
