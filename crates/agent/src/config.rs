//! Configuration management for the model agent.
//!
//! The configuration file is TOML by default (`~/.config/model-agent/config.toml`).
//! A `.json` file with the same keys is also accepted, matching the
//! `config.json` layout that tray deployments keep next to the executable.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default delay between a disconnect and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Default write size for streamed downloads (64KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Largest accepted write size (1MB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("config file not found at {0}")]
    NotFound(PathBuf),

    #[error("missing configuration value: {0}")]
    MissingField(&'static str),

    #[error("server_url must start with ws:// or wss://, got {0}")]
    InvalidServerUrl(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("reconnect_delay_secs must be between 1 and 3600, got {0}")]
    InvalidReconnectDelay(u64),

    #[error("chunk_size must be between 1 and {max} bytes, got {0}", max = MAX_CHUNK_SIZE)]
    InvalidChunkSize(usize),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Agent configuration.
///
/// The four connection fields have no usable default; they deserialize to
/// empty strings when absent and [`Config::validate`] reports them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// WebSocket endpoint of the command channel (`ws://` or `wss://`).
    pub server_url: String,

    /// Token sent in the `Authorization` header of the handshake.
    pub api_key: String,

    /// Directory all downloads land in and all deletes are confined to.
    pub root_path: PathBuf,

    /// Identifier sent in the `X-Client-ID` header of the handshake.
    pub client_id: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for a daily rolling log file. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,

    /// Seconds to wait before every reconnection attempt.
    pub reconnect_delay_secs: u64,

    /// Maximum number of bytes written per write call while streaming.
    pub chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_key: String::new(),
            root_path: PathBuf::new(),
            client_id: String::new(),
            log_level: "info".to_string(),
            log_dir: None,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("model-agent")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - MODEL_AGENT_SERVER_URL: Override the command channel endpoint
    /// - MODEL_AGENT_API_KEY: Override the handshake token
    /// - MODEL_AGENT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    ///
    /// Returns the names of the overridden fields. This runs before logging
    /// is initialized, so the caller reports them.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        let mut overridden = Vec::new();

        if let Some(url) = env_value("MODEL_AGENT_SERVER_URL") {
            self.server_url = url;
            overridden.push("server_url");
        }

        if let Some(key) = env_value("MODEL_AGENT_API_KEY") {
            self.api_key = key;
            overridden.push("api_key");
        }

        if let Some(level) = env_value("MODEL_AGENT_LOG_LEVEL") {
            self.log_level = level;
            overridden.push("log_level");
        }

        overridden
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::MissingField("server_url"));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingField("api_key"));
        }
        if self.root_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("root_path"));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::MissingField("client_id"));
        }

        let url = &self.server_url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidServerUrl(url.clone()));
        }

        let level = self.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }

        if self.reconnect_delay_secs == 0 || self.reconnect_delay_secs > 3600 {
            return Err(ConfigError::InvalidReconnectDelay(
                self.reconnect_delay_secs,
            ));
        }

        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::InvalidChunkSize(self.chunk_size));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// Unlike most settings files the agent cannot run without one, so a
    /// missing file is an error. Files ending in `.json` are parsed as JSON,
    /// everything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()).into());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let parsed = if is_json {
            Self::from_json(&contents)
        } else {
            Self::from_toml(&contents)
        };

        parsed.with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| anyhow::anyhow!("Invalid JSON configuration: {}", e))
    }

    /// Serialize configuration to a TOML string with the API key masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.api_key.is_empty() {
            shown.api_key = "********".to_string();
        }
        toml::to_string_pretty(&shown).context("Failed to serialize configuration to TOML")
    }

    /// Create the root directory if it is missing and return its path.
    pub fn ensure_root_dir(&self) -> Result<&Path> {
        fs::create_dir_all(&self.root_path).with_context(|| {
            format!(
                "Failed to create root directory: {}",
                self.root_path.display()
            )
        })?;
        Ok(&self.root_path)
    }

    /// Delay applied before every reconnection attempt.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}
