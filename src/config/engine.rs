use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Tuning for the reactive engine, loadable from `metaphor.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-request propagation deadline in milliseconds.
    pub propagation_deadline_ms: u64,
    /// How often the sweeper looks for `_dirty` resources, in seconds.
    pub sweep_interval_secs: u64,
    /// Compare-and-set retries when a calc write-back races another writer.
    pub write_retry_limit: u32,
    /// Bounded channel size per live-watch subscriber.
    pub watch_capacity: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            propagation_deadline_ms: 5_000,
            sweep_interval_secs: 30,
            write_retry_limit: 3,
            watch_capacity: 64,
            default_page_size: 10,
            max_page_size: 100,
        }
    }
}

impl EngineConfig {
    /// Loads the file if it exists, falling back to defaults otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    #[must_use]
    pub fn propagation_deadline(&self) -> Duration {
        Duration::from_millis(self.propagation_deadline_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
