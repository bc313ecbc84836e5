//! Configuration management for vmload.
//!
//! Loads configuration from ${VMLOAD_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::DEFAULT_EVENT_CHANNEL_CAPACITY;
use crate::session::{Session, SessionBuilder};

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log filter directive used when `RUST_LOG` is unset (e.g. "info", "vmload=debug").
    pub log_level: String,

    /// Optional file that receives logs in addition to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Capacity of channels that session events are forwarded into.
    pub event_channel_capacity: usize,

    /// Whether sessions that load a whole entity supersede other loads.
    pub entity_loads_exclusive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            entity_loads_exclusive: true,
        }
    }
}

impl Config {
    /// Loads configuration from the default path.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Starts a whole-entity session whose exclusivity follows
    /// `entity_loads_exclusive`.
    pub fn entity_session(&self, key: impl Into<String>) -> SessionBuilder {
        Session::builder()
            .entity(key)
            .exclusive(self.entity_loads_exclusive)
    }

    /// Renders the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

pub mod paths {
    //! VMLOAD_HOME resolution order:
    //! 1. VMLOAD_HOME environment variable (if set)
    //! 2. ~/.config/vmload (default)
    //! 3. ./.vmload when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the vmload home directory.
    pub fn vmload_home() -> PathBuf {
        if let Ok(home) = std::env::var("VMLOAD_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".vmload"),
            |h| h.join(".config").join("vmload"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        vmload_home().join("config.toml")
    }
}
