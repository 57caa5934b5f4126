//! Engine configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{JobError, Result};

/// Tunables for the job table, the capture buffer and the wait loop.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobControlConfig {
    /// Maximum number of background jobs tracked at once (default: 100)
    pub max_background_jobs: usize,
    /// Captured output cap in bytes; excess is dropped (default: 8192)
    pub output_capacity: usize,
    /// Bytes read from the capture pipe per wait-loop iteration (default: 256)
    pub read_chunk: usize,
    /// Sleep between wait-loop iterations in milliseconds (default: 1)
    pub poll_interval_ms: u64,
    /// Longest command text stored in a job record, in bytes (default: 511)
    pub max_command_len: usize,
    /// Re-run interval for multiwatch commands in milliseconds (default: 1000)
    pub watch_interval_ms: u64,
}

impl Default for JobControlConfig {
    fn default() -> Self {
        Self {
            max_background_jobs: 100,
            output_capacity: 8192,
            read_chunk: 256,
            poll_interval_ms: 1,
            max_command_len: 511,
            watch_interval_ms: 1000,
        }
    }
}

impl JobControlConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| JobError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| JobError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("max_background_jobs", self.max_background_jobs as u64),
            ("output_capacity", self.output_capacity as u64),
            ("read_chunk", self.read_chunk as u64),
            ("poll_interval_ms", self.poll_interval_ms),
            ("max_command_len", self.max_command_len as u64),
            ("watch_interval_ms", self.watch_interval_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(JobError::config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}
