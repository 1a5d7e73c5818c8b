//! # Tether Configuration
//!
//! Configuration management for the resilience layer.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TETHER_API_URL=https://api.example.com                             │
//! │     TETHER_SESSION_KEY=<64 hex chars>                                  │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tether/tether.toml (Linux)                               │
//! │     ~/Library/Application Support/dev.tether.tether/tether.toml (macOS)│
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [api]
//! base_url = "https://api.example.com"
//! refresh_path = "/auth/refresh"
//! request_timeout_secs = 15
//! connect_timeout_secs = 10
//!
//! [queue]
//! default_max_retries = 3
//! session_end_policy = "keep"   # keep | discard
//!
//! [scheduler]
//! sync_interval_secs = 30
//!
//! [storage]
//! database_path = "/var/lib/tether/tether.db"
//! session_path = "/var/lib/tether/session.json"
//! ```
//!
//! The session key is never written to the file; it only comes from
//! `TETHER_SESSION_KEY`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use tether_core::DEFAULT_MAX_RETRIES;

// =============================================================================
// Session End Policy
// =============================================================================

/// What happens to unsent operations when the session ends involuntarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndPolicy {
    /// Keep pending operations for the next sign-in.
    #[default]
    Keep,
    /// Drop pending operations and cached reads.
    Discard,
}

impl std::fmt::Display for SessionEndPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEndPolicy::Keep => write!(f, "keep"),
            SessionEndPolicy::Discard => write!(f, "discard"),
        }
    }
}

impl std::str::FromStr for SessionEndPolicy {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keep" => Ok(SessionEndPolicy::Keep),
            "discard" | "drop" => Ok(SessionEndPolicy::Discard),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown session end policy: '{}'. Valid options: keep, discard",
                other
            ))),
        }
    }
}

// =============================================================================
// API Settings
// =============================================================================

/// Remote API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Base URL every request path is joined onto.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path of the token refresh endpoint.
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,

    /// Per-request timeout (seconds). A timeout counts as a failed attempt.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// TCP/TLS connect timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_refresh_path() -> String {
    "/auth/refresh".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            base_url: default_base_url(),
            refresh_path: default_refresh_path(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

// =============================================================================
// Queue Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Retry budget for operations enqueued without an explicit one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default)]
    pub session_end_policy: SessionEndPolicy,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            default_max_retries: default_max_retries(),
            session_end_policy: SessionEndPolicy::default(),
        }
    }
}

// =============================================================================
// Scheduler Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Periodic drain interval while online (seconds).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

fn default_sync_interval() -> u64 {
    30
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            sync_interval_secs: default_sync_interval(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// SQLite file backing the durable store.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Encrypted session file.
    #[serde(default = "default_session_path")]
    pub session_path: PathBuf,

    /// Hex-encoded 32-byte vault key. Environment only.
    #[serde(skip)]
    pub session_key: Option<String>,
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "tether", "tether")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_database_path() -> PathBuf {
    data_dir().join("tether.db")
}

fn default_session_path() -> PathBuf {
    data_dir().join("session.json")
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            database_path: default_database_path(),
            session_path: default_session_path(),
            session_key: None,
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete configuration for a [`TetherClient`](crate::TetherClient).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub queue: QueueSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

impl TetherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (tether.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading tether config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load tether config: {}. Using defaults.", e);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Tether config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let url = url::Url::parse(&self.api.base_url)?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "API URL must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if !self.api.refresh_path.starts_with('/') {
            return Err(SyncError::InvalidConfig(
                "refresh_path must start with '/'".into(),
            ));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.queue.default_max_retries == 0 {
            return Err(SyncError::InvalidConfig(
                "default_max_retries must be greater than 0".into(),
            ));
        }

        if self.scheduler.sync_interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync_interval_secs must be greater than 0".into(),
            ));
        }

        if let Some(key) = &self.storage.session_key {
            let valid = key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(SyncError::InvalidConfig(
                    "session key must be 64 hex characters".into(),
                ));
            }
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TETHER_API_URL") {
            debug!(url = %url, "Overriding API URL from environment");
            self.api.base_url = url;
        }

        if let Ok(secs) = std::env::var("TETHER_REQUEST_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.api.request_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid TETHER_REQUEST_TIMEOUT_SECS"),
            }
        }

        if let Ok(secs) = std::env::var("TETHER_SYNC_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.scheduler.sync_interval_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid TETHER_SYNC_INTERVAL_SECS"),
            }
        }

        if let Ok(path) = std::env::var("TETHER_DB_PATH") {
            self.storage.database_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("TETHER_SESSION_PATH") {
            self.storage.session_path = PathBuf::from(path);
        }

        if let Ok(key) = std::env::var("TETHER_SESSION_KEY") {
            self.storage.session_key = Some(key);
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "tether", "tether")
            .map(|dirs| dirs.config_dir().join("tether.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.api.connect_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.sync_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("keep".parse::<SessionEndPolicy>().unwrap(), SessionEndPolicy::Keep);
        assert_eq!(
            "Discard".parse::<SessionEndPolicy>().unwrap(),
            SessionEndPolicy::Discard
        );
        assert!("forget".parse::<SessionEndPolicy>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = TetherConfig::default();
        assert_eq!(config.api.request_timeout_secs, 15);
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.scheduler.sync_interval_secs, 30);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TetherConfig::default();

        config.api.base_url = "ftp://example.com".into();
        assert!(config.validate().unwrap_err().is_config_error());

        config.api.base_url = "https://api.example.com".into();
        config.queue.default_max_retries = 0;
        assert!(config.validate().is_err());

        config.queue.default_max_retries = 5;
        config.storage.session_key = Some("abc".into());
        assert!(config.validate().is_err());

        config.storage.session_key = Some("ab".repeat(32));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: TetherConfig = toml::from_str(
            r#"
            [api]
            base_url = "https://api.example.com"

            [queue]
            session_end_policy = "discard"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.base_url, "https://api.example.com");
        assert_eq!(config.api.refresh_path, "/auth/refresh");
        assert_eq!(config.queue.session_end_policy, SessionEndPolicy::Discard);
        assert_eq!(config.scheduler.sync_interval_secs, 30);
    }

    #[test]
    fn test_save_never_writes_session_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");

        let mut config = TetherConfig::default();
        config.storage.session_key = Some("cd".repeat(32));
        config.save(Some(path.clone())).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[api]"));
        assert!(written.contains("[scheduler]"));
        assert!(!written.contains(&"cd".repeat(32)));
    }
}
