//! Configuration loading for the dnslice CLI.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use dnslice_lib::{
    error::{Phase, StartupError, StartupReason},
    ClientSettings, Settings,
};
use securefmt::Debug;
use serde::{Deserialize, Serialize};

/// dnslice CLI configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Protocol settings shared by the server and the fetcher.
    pub dns: Settings,
    /// What the server publishes.
    pub publish: PublishConfig,
    /// Fetcher retry tuning.
    pub client: ClientSettings,
}

/// Publish-specific settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Files to publish, in order.
    pub files: Vec<PathBuf>,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StartupError::new(
                Phase::Config,
                StartupReason::UnreadableFile,
                format!("failed to read config file {}: {e}", path.display()),
            )
        })?;

        toml::from_str(&content)
            .map_err(|e| StartupError::config(format!("failed to parse config: {e}")))
    }
}
