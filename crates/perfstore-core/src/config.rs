//! Configuration management for perfstore
//!
//! Handles loading and validation of perfstore.toml configuration files.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "PERFSTORE_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Poll runner settings
    #[serde(default)]
    pub polling: PollingConfig,

    /// Response cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file, appended to alongside stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one database file per namespace
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.local/share/perfstore".to_string()
}

fn default_busy_timeout() -> u64 {
    5000
}

impl StorageConfig {
    /// Data directory with a leading `~` expanded to the home directory
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_home(&self.data_dir)
    }
}

/// Poll runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Delay between two poll iterations in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Granularity at which a sleeping runner re-checks its stop flag
    #[serde(default = "default_stop_check_interval")]
    pub stop_check_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stop_check_interval_ms: default_stop_check_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    250
}

fn default_stop_check_interval() -> u64 {
    50
}

impl PollingConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn stop_check_interval(&self) -> Duration {
        Duration::from_millis(self.stop_check_interval_ms)
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries kept per service; 1 keeps only the most recent response
    #[serde(default = "default_cache_capacity")]
    pub response_cache_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_cache_capacity() -> usize {
    1
}

impl CacheConfig {
    /// Capacity as the non-zero value the cache needs; zero is clamped to 1
    #[must_use]
    pub fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.response_cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// `$PERFSTORE_CONFIG` wins when set; otherwise the per-user config file is
    /// read if it exists. With no file at all the built-in defaults are used.
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load_from(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let display = path.display().to_string();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(display).into());
            }
            Err(e) => return Err(ConfigError::ReadFailed(display, e.to_string()).into()),
        };
        let config = Self::from_toml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without validating it
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "polling.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.polling.stop_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "polling.stop_check_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.cache.response_cache_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "cache.response_cache_capacity must be greater than 0".to_string(),
            ));
        }
        if self.storage.data_dir.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.data_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("perfstore").join("perfstore.toml"))
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
