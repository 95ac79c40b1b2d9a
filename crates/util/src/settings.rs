//! Engine settings persisted as JSON.
//!
//! Settings are read from `$RUNBOOK_SETTINGS_PATH` when set, otherwise from the
//! standard configuration directory (`~/.config/runbook/settings.json` on most
//! platforms). A missing file yields defaults and a malformed one is logged and
//! ignored. `RUNBOOK_CONCURRENCY` and `RUNBOOK_CACHE_DIR` override the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use dirs_next::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::expand_tilde;

/// Environment variable allowing callers to override the settings file path.
pub const SETTINGS_PATH_ENV: &str = "RUNBOOK_SETTINGS_PATH";
/// Environment variable overriding [`EngineSettings::concurrency`].
pub const CONCURRENCY_ENV: &str = "RUNBOOK_CONCURRENCY";
/// Environment variable overriding [`EngineSettings::cache_dir`].
pub const CACHE_DIR_ENV: &str = "RUNBOOK_CACHE_DIR";

/// Default filename for the JSON payload.
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Error surfaced when reading or writing settings fails.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// I/O failure (for example, permissions or missing directory).
    #[error("settings I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure.
    #[error("settings serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persisted engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of books executed concurrently.
    pub concurrency: usize,
    /// Root directory holding already-fetched remote books.
    pub cache_dir: Option<PathBuf>,
    /// Per-request timeout applied to HTTP runners that do not set their own.
    pub http_timeout_secs: Option<u64>,
    /// Delay applied between loop iterations when a loop omits `interval`.
    pub default_interval: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            cache_dir: None,
            http_timeout_secs: None,
            default_interval: None,
        }
    }
}

impl EngineSettings {
    /// Loads settings from the default location and applies environment overrides.
    pub fn load() -> Result<Self, SettingsError> {
        let path = default_settings_path();
        let mut settings = Self::load_from(&path)?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Loads settings from `path` without consulting the environment.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(settings) => Ok(settings),
                Err(error) => {
                    warn!(
                        path = %path.display(),
                        error = %error,
                        "Failed to parse settings file; using defaults"
                    );
                    Ok(Self::default())
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(SettingsError::Io(error)),
        }
    }

    /// Writes the settings as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var(CONCURRENCY_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(value) if value > 0 => self.concurrency = value,
                _ => warn!(value = %raw, "Ignoring invalid RUNBOOK_CONCURRENCY value"),
            }
        }
        if let Ok(raw) = env::var(CACHE_DIR_ENV)
            && !raw.trim().is_empty()
        {
            self.cache_dir = Some(expand_tilde(&raw));
        }
    }
}

/// Resolves the settings file path, honoring [`SETTINGS_PATH_ENV`].
pub fn default_settings_path() -> PathBuf {
    if let Ok(path) = env::var(SETTINGS_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }

    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runbook")
        .join(SETTINGS_FILE_NAME)
}
