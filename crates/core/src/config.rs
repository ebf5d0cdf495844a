use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::ApiMode;

pub const APP_DIR_NAME: &str = "repdash";

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value `{value}` for {key}")]
    InvalidOverride { key: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub mock_mode: bool,
    pub undo_window_ms: u64,
    pub health_poll_secs: u64,
    pub name_check_debounce_ms: u64,
    pub schema_ttl_secs: u64,
    pub log_level: String,
    pub cache_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            mock_mode: false,
            undo_window_ms: 5_000,
            health_poll_secs: 15,
            name_check_debounce_ms: 200,
            schema_ttl_secs: 300,
            log_level: "info".to_string(),
            cache_path: None,
        }
    }
}

impl AppConfig {
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = config_dir()?.join("config.toml");
        let mut config = Self::load_from_path(&path)?;
        config.apply_env_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Environment wins over the file.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("REPDASH_API_BASE_URL").filter(|url| !url.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(raw) = lookup("REPDASH_MOCK_MODE") {
            self.mock_mode = parse_flag(&raw).ok_or(ConfigError::InvalidOverride {
                key: "REPDASH_MOCK_MODE",
                value: raw,
            })?;
        }
        if let Some(level) = lookup("REPDASH_LOG").filter(|level| !level.trim().is_empty()) {
            self.log_level = level.trim().to_string();
        }
        Ok(())
    }

    #[must_use]
    pub fn api_mode(&self) -> ApiMode {
        if self.mock_mode {
            ApiMode::Mock
        } else {
            ApiMode::Live
        }
    }

    #[must_use]
    pub fn undo_window(&self) -> Duration {
        Duration::from_millis(self.undo_window_ms)
    }

    #[must_use]
    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_secs.max(1))
    }

    #[must_use]
    pub fn name_check_debounce(&self) -> Duration {
        Duration::from_millis(self.name_check_debounce_ms)
    }

    #[must_use]
    pub fn schema_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_ttl_secs)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// `<config home>/repdash`, honoring `REPDASH_CONFIG_DIR`.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    if let Some(custom) = env::var_os("REPDASH_CONFIG_DIR") {
        return Ok(PathBuf::from(custom));
    }

    let base_dir = if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(ConfigError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(ConfigError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join(APP_DIR_NAME))
}
