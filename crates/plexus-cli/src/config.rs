//! Application configuration.
//!
//! One TOML file, loaded once in `main` and handed down by value:
//!
//! ```toml
//! [kernel]
//! name = "plexus"
//! bus_capacity = 1024
//!
//! [log]
//! level = "info"
//! json = false
//!
//! [storage]
//! source_dir = "sources"
//! readiness_timeout_ms = 30000
//! ```
//!
//! A relative `storage.source_dir` is resolved against the directory holding
//! the config file.

use std::path::Path;

use anyhow::{Context, Result};
use plexus_storage::StorageSettings;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub kernel: KernelSettings,
    pub log: LogSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    /// Node name, used in logs.
    pub name: String,
    /// Per-channel capacity of the signal bus.
    pub bus_capacity: usize,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            name: "plexus".into(),
            bus_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive; `RUST_LOG` overrides it.
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Read and parse `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse TOML config {}", path.display()))?;

        if let (Some(dir), Some(base)) = (config.storage.source_dir.as_mut(), path.parent()) {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }

        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}
