//! # Error Types
//!
//! Domain-specific error types for tether-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tether-core errors (this file)                                        │
//! │  ├── CoreError        - Domain errors (bad durations, bad records)     │
//! │  └── ValidationError  - Caller input rejected at enqueue/write time    │
//! │                                                                         │
//! │  tether-db errors                                                      │
//! │  └── DbError          - Durable store failures                         │
//! │                                                                         │
//! │  tether-sync errors                                                    │
//! │  └── SyncError        - Network / Auth / Storage / Validation          │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError::ValidationFailure      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// A TTL could not be represented as a timestamp offset.
    #[error("TTL out of range: {0:?}")]
    TtlOutOfRange(std::time::Duration),

    /// Unknown priority name.
    #[error("Unknown priority: '{0}'. Valid options: low, medium, high")]
    UnknownPriority(String),

    /// Unknown HTTP method name.
    #[error("Unsupported HTTP method: '{0}'")]
    UnknownMethod(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These are caller mistakes: rejected immediately, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
