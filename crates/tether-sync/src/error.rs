//! # Sync Error Types
//!
//! Error types for the resilience layer.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Transient    │  │      Auth       │  │      Fatal              │ │
//! │  │  (retry_count++)│  │ (refresh or end)│  │  (surfaced, no retry)   │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  NetworkFailure │  │  AuthFailure    │  │  StorageFailure         │ │
//! │  │  Timeout        │  │                 │  │  ValidationFailure      │ │
//! │  │  ServerError    │  │                 │  │  CryptoFailure          │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐  │
//! │  │  Configuration  │  │  Internal                                   │  │
//! │  │                 │  │                                             │  │
//! │  │  InvalidConfig  │  │  SerializationFailed, ShuttingDown,         │  │
//! │  │  InvalidUrl     │  │  Internal                                   │  │
//! │  │  ConfigLoad/Save│  │                                             │  │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all resilience-layer failures.
///
/// Every variant carries plain strings so the error is `Clone`: one drain
/// pass or one refresh result is handed to several waiters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    // =========================================================================
    // Transient Errors
    // =========================================================================
    /// Request never produced a response (DNS, refused, reset, offline).
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// Request exceeded the per-request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Server answered with a non-success status other than 401.
    #[error("Server returned {status}: {message}")]
    ServerError { status: u16, message: String },

    // =========================================================================
    // Auth Errors
    // =========================================================================
    /// No valid session, refresh failed, or a replayed request was rejected again.
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    // =========================================================================
    // Fatal Errors
    // =========================================================================
    /// Durable store could not complete an operation.
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Caller input rejected before anything was persisted.
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    /// Session vault could not encrypt or decrypt.
    #[error("Session vault error: {0}")]
    CryptoFailure(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// The client has been closed.
    #[error("Tether client is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<tether_db::DbError> for SyncError {
    fn from(err: tether_db::DbError) -> Self {
        SyncError::StorageFailure(err.to_string())
    }
}

impl From<tether_core::CoreError> for SyncError {
    fn from(err: tether_core::CoreError) -> Self {
        SyncError::ValidationFailure(err.to_string())
    }
}

impl From<tether_core::ValidationError> for SyncError {
    fn from(err: tether_core::ValidationError) -> Self {
        SyncError::ValidationFailure(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else {
            SyncError::NetworkFailure(err.to_string())
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true for failures expected to clear up on their own.
    ///
    /// ## Retryable
    /// - Network failures and timeouts
    /// - 408, 429 and 5xx responses
    ///
    /// The queue still counts every failed attempt against `max_retries`;
    /// this only tells callers whether trying again is likely to help.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::NetworkFailure(_) | SyncError::Timeout(_) => true,
            SyncError::ServerError { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    /// Returns true if the session must be refreshed or re-established.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, SyncError::AuthFailure(_))
    }

    /// Returns true if local storage is broken; the current pass must stop.
    pub fn is_storage_error(&self) -> bool {
        matches!(self, SyncError::StorageFailure(_))
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }
}
