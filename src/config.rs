//! Program configuration
//!
//! Loaded from JSON. Lookup order: an explicit path, then
//! `<config_dir>/nvs-blob/config.json` if present, then built-in defaults.

use crate::flash::DEFAULT_CAPACITY;
use crate::nvs::{validate_name, DEFAULT_MAX_BLOB_SIZE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How written blobs are filled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fill {
    /// All zero bytes
    Zeros,
    /// Every byte is the low byte of the pass number
    Pass,
}

/// A blob written on every pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSpec {
    pub key: String,
    pub len: usize,
}

/// Partition settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Usable bytes of the partition
    pub capacity: usize,
    pub max_blob_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            capacity: DEFAULT_CAPACITY,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
        }
    }
}

/// Read/write loop settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    pub namespace: String,
    pub blobs: Vec<BlobSpec>,
    pub counter_key: String,
    /// Pause between passes
    pub interval_ms: u64,
    /// Wipe the partition before the first init
    pub erase_on_boot: bool,
    pub fill: Fill,
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleConfig {
            namespace: "storage".to_string(),
            blobs: vec![
                BlobSpec {
                    key: "storage_blob_1".to_string(),
                    len: 6000,
                },
                BlobSpec {
                    key: "storage_blob_2".to_string(),
                    len: 6000,
                },
            ],
            counter_key: "restart_counter".to_string(),
            interval_ms: 100,
            erase_on_boot: true,
            fill: Fill::Zeros,
        }
    }
}

impl CycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cycle: CycleConfig,
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nvs-blob").join("config.json"))
    }

    /// Load from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else the default file if it exists, else defaults
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(default),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let cycle = &self.cycle;
        validate_name(&cycle.namespace)
            .map_err(|e| Error::Config(format!("namespace: {}", e)))?;
        validate_name(&cycle.counter_key)
            .map_err(|e| Error::Config(format!("counter_key: {}", e)))?;

        if cycle.interval_ms == 0 {
            return Err(Error::Config("interval_ms must be positive".into()));
        }
        if self.storage.capacity == 0 {
            return Err(Error::Config("capacity must be positive".into()));
        }

        for blob in &cycle.blobs {
            validate_name(&blob.key).map_err(|e| Error::Config(format!("blob key: {}", e)))?;
            if blob.len > self.storage.max_blob_size {
                return Err(Error::Config(format!(
                    "blob {} is {} bytes, max_blob_size is {}",
                    blob.key, blob.len, self.storage.max_blob_size
                )));
            }
            if blob.key == cycle.counter_key {
                return Err(Error::Config(format!(
                    "blob key {} collides with counter_key",
                    blob.key
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_reference_program() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cycle.namespace, "storage");
        assert_eq!(config.cycle.blobs.len(), 2);
        assert_eq!(config.cycle.blobs[0].len, 6000);
        assert_eq!(config.cycle.interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "cycle": { "interval_ms": 5, "fill": "pass" } }"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.cycle.interval_ms, 5);
        assert_eq!(config.cycle.fill, Fill::Pass);
        assert_eq!(config.cycle.namespace, "storage");
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        config.cycle.namespace = "a_namespace_that_is_too_long".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.cycle.interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cycle.blobs[0].len = config.storage.max_blob_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(Config::resolve(Some(&missing)).is_err());
    }
}
