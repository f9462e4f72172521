//! Configuration plumbing shared by Graham services.
//!
//! Configuration files live under `~/.graham/`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (`GRAHAM_*` prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `GRAHAM_LOG_LEVEL` → observability.log_level
//! - `GRAHAM_LOG_FORMAT` → observability.log_format
//!
//! Pipeline-specific keys are mapped by the pipeline crate using [`env_override`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, ResultExt};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".graham"),
        |dirs| dirs.home_dir().join(".graham"),
    )
}

/// Get the path of a named configuration file inside the config directory.
pub fn config_path(file_name: &str) -> PathBuf {
    config_dir().join(file_name)
}

/// Load a JSON configuration file, falling back to defaults when it is absent.
pub fn load_json_or_default<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        tracing::info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(T::default());
    }

    let content =
        fs::read_to_string(path).context(format!("Failed to read config from {}", path.display()))?;

    serde_json::from_str(&content).context(format!("Failed to parse config from {}", path.display()))
}

/// Overwrite `target` with the parsed value of environment variable `key`, if set.
///
/// Unparseable values are logged and ignored so a typo never silently zeroes a field.
pub fn env_override<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl ObservabilityConfig {
    /// Apply `GRAHAM_LOG_*` overrides.
    pub fn apply_env_overrides(&mut self) {
        env_override("GRAHAM_LOG_LEVEL", &mut self.log_level);
        env_override("GRAHAM_LOG_FORMAT", &mut self.log_format);
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
