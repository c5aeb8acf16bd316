//! Group configuration.
//!
//! A [`GroupConfig`] may be built in code or deserialized from TOML, usually as a section of a
//! larger application config.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::flight::PanicPolicy;

fn default_name() -> String {
    "flightgroup".to_owned()
}

/// Settings shared by [`Group`](crate::Group) and [`AsyncGroup`](crate::AsyncGroup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupConfig {
    /// Name attached to tracing events and used as the prefix of detached executor threads.
    #[serde(default = "default_name")]
    pub name: String,

    /// What the leader does when its work function panics.
    #[serde(default)]
    pub panic_policy: PanicPolicy,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            panic_policy: PanicPolicy::default(),
        }
    }
}

/// Failure to load a [`GroupConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config parsed but failed [`GroupConfig::validate`].
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    /// The TOML was malformed or did not match the schema.
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// The config file could not be read.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GroupConfig {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("Group name must not be empty.".to_owned());
        }
        if self.name.contains('\0') {
            errors.push(format!(
                "Group name '{}' contains a NUL byte.",
                self.name.escape_debug()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse and validate a config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Load and validate a config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading group configuration.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
