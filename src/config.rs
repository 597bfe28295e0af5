//! Configuration loading
//!
//! Settings are read from a TOML file. Without an explicit path the
//! platform config directory is used when it holds a file:
//! - Linux: ~/.config/relaylobby/config.toml
//! - Windows: %APPDATA%\relaylobby\config.toml
//! - macOS: ~/Library/Application Support/relaylobby/config.toml

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::services::RelayProtocol;

/// Application name used for the configuration directory
const APP_NAME: &str = "relaylobby";

/// Relay slots reserved for remote participants (7 + host = 8 players)
pub const DEFAULT_MAX_CONNECTIONS: u32 = 7;

const DEFAULT_STEP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_EVENT_BUFFER: usize = 64;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 500;
const DEFAULT_WINDOW_SIZE: usize = 10;
const DEFAULT_SMOOTHING: f32 = 0.1;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Session orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Maximum remote participants when hosting
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Upper bound for each remote step of a host/join attempt
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Start the authority as a dedicated server without a local player
    #[serde(default)]
    pub dedicated_server: bool,

    /// Relay connection type used by the transport
    #[serde(default)]
    pub relay_protocol: RelayProtocol,

    /// Buffered session events per subscriber
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_step_timeout_ms() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            dedicated_server: false,
            relay_protocol: RelayProtocol::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SessionConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.step_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "step_timeout_ms must be positive".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Statistics sampling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsConfig {
    /// Time between samples
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Samples kept for latency and bandwidth averages
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Smoothing factor for the frame rate
    #[serde(default = "default_smoothing")]
    pub smoothing: f32,

    /// Whether the stats panel starts visible
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_interval_ms() -> u64 {
    DEFAULT_SAMPLE_INTERVAL_MS
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_smoothing() -> f32 {
    DEFAULT_SMOOTHING
}

fn default_visible() -> bool {
    true
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            window_size: DEFAULT_WINDOW_SIZE,
            smoothing: DEFAULT_SMOOTHING,
            visible: true,
        }
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "interval_ms must be positive".to_string(),
            ));
        }
        if self.window_size == 0 {
            return Err(ConfigError::Invalid(
                "window_size must be at least 1".to_string(),
            ));
        }
        if !(self.smoothing > 0.0 && self.smoothing <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "smoothing must be in (0, 1], got {}",
                self.smoothing
            )));
        }
        Ok(())
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub stats: StatsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        self.stats.validate()
    }

    /// Parse and validate a TOML document
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        debug!("Loaded config from {:?}", path);
        Self::from_toml(&contents)
    }

    /// Load from `path` if given, else from the default location, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Default configuration file path
///
/// Returns None if the platform config directory cannot be determined.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}
