//! Configuration management for sshubl

mod settings;
pub mod serde_utils;

pub use settings::{BackoffConfig, ReconnectConfig, Settings};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sshubl")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    Ok(toml::from_str(&content)?)
}

/// Load settings, falling back to defaults when the file does not exist
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    let settings = match load_config::<Settings>(path) {
        Ok(settings) => settings,
        Err(ConfigError::NotFound(_)) => {
            tracing::debug!("No config at {}, using defaults", path.display());
            Settings::default()
        }
        Err(e) => return Err(e),
    };
    settings.validate()?;
    Ok(settings)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}
