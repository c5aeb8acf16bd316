//! Module for the demo binary's configuration settings.
//!
//! Settings may be specified in a TOML configuration file; everything has a default.

use std::path::{Path, PathBuf};

use flightgroup::{ConfigError, GroupConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_callers() -> usize {
    8
}

fn default_delay_ms() -> u64 {
    50
}

fn default_key() -> String {
    "build:target-A".to_owned()
}

/// Parameters of a deduplication storm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StormConfig {
    /// How many concurrent callers race for the key.
    #[serde(default = "default_callers")]
    pub callers: usize,

    /// Artificial duration of the work function, in milliseconds.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// The key every caller uses.
    #[serde(default = "default_key")]
    pub key: String,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            callers: default_callers(),
            delay_ms: default_delay_ms(),
            key: default_key(),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub group: GroupConfig,

    #[serde(default)]
    pub storm: StormConfig,
}

impl Config {
    /// Validate the correctness of the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.group.validate().err().unwrap_or_default();

        if self.storm.callers == 0 {
            errors.push("Storm needs at least one caller.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("flightgroup").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("flightgroup").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/flightgroup/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    /// Loads config from a single TOML file.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from the external path if given, else the first config file found,
    /// else the defaults.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let found = external_config_path
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file);

        let config = match found {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}
