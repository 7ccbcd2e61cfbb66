//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/browse-sync/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/browse-sync/` (~/.config/browse-sync/)
//! - State/Logs: `$XDG_STATE_HOME/browse-sync/` (~/.local/state/browse-sync/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Coordinator endpoints and connection behavior
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Store and pagination tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordinator connection configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CoordinatorConfig {
    /// GraphQL endpoint for queries and page fetches
    #[serde(default = "default_http_url")]
    pub http_url: String,

    /// GraphQL endpoint for subscriptions (ws:// or wss://)
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Sent as `Authorization: Bearer` and in the `connection_init` payload
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Max seconds to wait for `connection_ack`
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Fixed delay before reconnecting after an unexpected close
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: default_ws_url(),
            api_key: None,
            timeout_secs: default_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

fn default_http_url() -> String {
    "http://127.0.0.1:41957/graphql".to_string()
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:41957/graphql".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5
}

impl CoordinatorConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.http_url.trim().is_empty() {
            return Err(Error::Config("coordinator.http_url must not be empty".to_string()));
        }
        let ws = url::Url::parse(&self.ws_url)
            .map_err(|e| Error::Config(format!("coordinator.ws_url is invalid: {}", e)))?;
        if ws.scheme() != "ws" && ws.scheme() != "wss" {
            return Err(Error::Config(format!(
                "coordinator.ws_url must use ws:// or wss://, got {}://",
                ws.scheme()
            )));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(Error::Config(
                "coordinator.handshake_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    /// Base URL for non-GraphQL routes such as `/health`.
    pub fn base_url(&self) -> String {
        let trimmed = self.http_url.trim_end_matches('/');
        trimmed
            .strip_suffix("/graphql")
            .unwrap_or(trimmed)
            .to_string()
    }
}

/// Store and pagination tuning
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Edges requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Mutations held for connections that have not been fetched yet
    #[serde(default = "default_pending_capacity")]
    pub pending_buffer_capacity: usize,

    /// Capacity of the store change-notification channel
    #[serde(default = "default_change_capacity")]
    pub change_channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            pending_buffer_capacity: default_pending_capacity(),
            change_channel_capacity: default_change_capacity(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Config("sync.page_size must be at least 1".to_string()));
        }
        if self.pending_buffer_capacity == 0 {
            return Err(Error::Config(
                "sync.pending_buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.change_channel_capacity == 0 {
            return Err(Error::Config(
                "sync.change_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_page_size() -> usize {
    50
}

fn default_pending_capacity() -> usize {
    256
}

fn default_change_capacity() -> usize {
    1024
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.coordinator.validate()?;
        self.sync.validate()
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/browse-sync/config.toml` (~/.config/browse-sync/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("browse-sync").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/browse-sync/` (~/.local/state/browse-sync/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("browse-sync")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/browse-sync/browse-sync.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("browse-sync.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.coordinator.reconnect_delay_secs, 5);
        assert_eq!(config.coordinator.ws_url, "ws://127.0.0.1:41957/graphql");
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.sync.pending_buffer_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[coordinator]
http_url = "https://coordinator.local/graphql"
ws_url = "wss://coordinator.local/graphql"
api_key = "key_123"
reconnect_delay_secs = 2

[sync]
page_size = 25

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.coordinator.api_key.as_deref(), Some("key_123"));
        assert_eq!(config.coordinator.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(config.coordinator.timeout_secs, 30);
        assert_eq!(config.sync.page_size, 25);
        assert_eq!(config.sync.pending_buffer_capacity, 256);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ws_scheme_validation() {
        let config = CoordinatorConfig {
            ws_url: "http://127.0.0.1:41957/graphql".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CoordinatorConfig {
            ws_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sync_validation() {
        let config = SyncConfig {
            page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SyncConfig {
            pending_buffer_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_url_strips_graphql_path() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.base_url(), "http://127.0.0.1:41957");

        let config = CoordinatorConfig {
            http_url: "https://example.com/api/".to_string(),
            ..Default::default()
        };
        assert_eq!(config.base_url(), "https://example.com/api");
    }

    #[test]
    fn test_load_from_file_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\npage_size = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, "[sync]\npage_size = 10\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.sync.page_size, 10);
    }
}
