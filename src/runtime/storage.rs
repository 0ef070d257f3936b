//! Filesystem layout helpers and atomic write operations
//!
//! Manages the .jamcore/ directory: the node configuration and the last
//! status snapshot written by a running node. Writes go through a temp file
//! and a rename.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::RuntimeConfig;
use super::control::RuntimeStatus;

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the status snapshot path
    pub fn status_path(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        file.write_all(data).context("Failed to write data")?;
        file.sync_all().context("Failed to sync file")?;
        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;
            dir.sync_all().context("Failed to sync directory")?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Persist a status snapshot
    pub fn write_status(&self, status: &RuntimeStatus) -> Result<()> {
        let json = serde_json::to_vec_pretty(status).context("Failed to serialize status")?;
        self.write_atomic(&self.status_path(), &json)
    }

    /// Load the last status snapshot, if one was written
    pub fn load_status(&self) -> Result<Option<RuntimeStatus>> {
        let path = self.status_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = self.read_file(&path)?;
        let status = serde_json::from_slice(&data).context("Failed to deserialize status")?;
        Ok(Some(status))
    }
}

/// Initialize the storage directory for a new node
pub fn init_storage(root: &Path) -> Result<()> {
    fs::create_dir_all(root).with_context(|| format!("Failed to create directory: {:?}", root))
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> Result<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> Result<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    let data = storage.read_file(&storage.config_path())?;
    let mut config: RuntimeConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    config.root = root.to_path_buf();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::condition::Tier;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("node");
        init_storage(&root).unwrap();

        let config = RuntimeConfig {
            root: root.clone(),
            tier: Tier::Fog,
            links: vec![Tier::Fog, Tier::Cloud],
            app_tag: "sensors".to_string(),
            ack_timeout_ms: 150,
            ..RuntimeConfig::default()
        };
        write_config(&config).unwrap();

        let loaded = load_config(&root).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("config.json"), br#"{"tier": "Cloud", "port": 9000}"#).unwrap();

        let loaded = load_config(temp.path()).unwrap();
        assert_eq!(loaded.tier, Tier::Cloud);
        assert_eq!(loaded.port, 9000);
        assert_eq!(loaded.ack_timeout_ms, 300);
        assert_eq!(loaded.root, temp.path());
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let test_file = temp.path().join("test.dat");

        storage.write_atomic(&test_file, b"Hello, world!").unwrap();
        assert_eq!(storage.read_file(&test_file).unwrap(), b"Hello, world!");
        assert!(!temp.path().join("test.tmp").exists());
    }

    #[test]
    fn test_status_roundtrip() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        assert!(storage.load_status().unwrap().is_none());

        let status = RuntimeStatus::from_config(&RuntimeConfig::default());
        storage.write_status(&status).unwrap();
        assert_eq!(storage.load_status().unwrap(), Some(status));
    }
}
