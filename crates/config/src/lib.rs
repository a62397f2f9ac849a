//! Typed configuration for the PendingDNS core
//!
//! The configuration *file* is a collaborator concern (the CLI loads it and
//! hands the core a [`Config`]); this crate owns the typed shape, the
//! defaults, and validation. Every key here has a documented runtime effect
//! in one of the core subsystems.

mod defaults;
mod types;
mod validation;

pub use types::*;
pub use validation::ConfigError;

use std::path::Path;

impl Config {
    /// Parse a TOML configuration file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}
