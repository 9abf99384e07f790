use crate::{db::DEFAULT_SNAPSHOT_PATH, error::SupertagError, query::DEFAULT_SEARCH_LIMIT};
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::Path,
    time::Duration,
};

/// Settings of the sync service. Every field has a default, so a partial (or absent) TOML file
/// is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Vault path of the store image.
    pub snapshot_path: String,
    /// Quiet period after the last mutation before the store image is written.
    pub save_debounce_ms: u64,
    /// Document extensions that are synced, without the dot.
    pub extensions: Vec<String>,
    /// Result cap for searches that do not set their own.
    pub search_limit: u32,
    /// Quiet period the filesystem watcher waits for before reporting a change.
    pub watch_debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            snapshot_path: DEFAULT_SNAPSHOT_PATH.to_string(),
            save_debounce_ms: 2000,
            extensions: vec!["md".to_string()],
            search_limit: DEFAULT_SEARCH_LIMIT,
            watch_debounce_ms: 500,
        }
    }
}

impl SyncConfig {
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<SyncConfig, SupertagError> {
        let path = path.as_ref();
        tracing::debug!("Attempting to read sync config from: {:?}", path);
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(SyncConfig::default());
        }
        let content = read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SupertagError> {
        let toml_string = toml::to_string(self)?;
        write(path, toml_string)?;
        Ok(())
    }
}
