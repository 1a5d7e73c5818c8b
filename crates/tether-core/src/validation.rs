//! # Validation Module
//!
//! Enqueue-time and write-time input checks.
//!
//! A rejected input is a caller error: it is reported immediately and never
//! reaches the durable store.

use crate::error::ValidationError;
use crate::types::PendingOperationInput;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Upper bound on endpoint path length.
pub const MAX_PATH_LEN: usize = 2048;

/// Upper bound on cache key length.
pub const MAX_CACHE_KEY_LEN: usize = 512;

/// Validates a mutation before it is assigned an id.
///
/// ## Rules
/// - `max_retries`, when given, must be greater than zero
/// - `path` must be non-empty, at most [`MAX_PATH_LEN`] chars, no whitespace,
///   and either start with a single `/` or be an absolute `http(s)` URL
/// - header names must be non-empty
/// - when an entity is given, both its type and id must be non-empty
pub fn validate_operation_input(input: &PendingOperationInput) -> ValidationResult<()> {
    if input.max_retries == Some(0) {
        return Err(ValidationError::MustBePositive {
            field: "max_retries".to_string(),
        });
    }

    validate_path(&input.path)?;

    for (name, _) in &input.headers {
        if name.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "header name".to_string(),
            });
        }
    }

    if let Some(entity) = &input.entity {
        if entity.entity_type.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "entity_type".to_string(),
            });
        }
        if entity.entity_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "entity_id".to_string(),
            });
        }
    }

    Ok(())
}

/// Validates an endpoint path.
pub fn validate_path(path: &str) -> ValidationResult<()> {
    if path.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "path".to_string(),
        });
    }

    if path.len() > MAX_PATH_LEN {
        return Err(ValidationError::TooLong {
            field: "path".to_string(),
            max: MAX_PATH_LEN,
        });
    }

    if path.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidFormat {
            field: "path".to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    let absolute = path.starts_with("https://") || path.starts_with("http://");
    if path.starts_with("//") || (!path.starts_with('/') && !absolute) {
        return Err(ValidationError::InvalidFormat {
            field: "path".to_string(),
            reason: "must start with '/' or be an absolute http(s) URL".to_string(),
        });
    }

    Ok(())
}

/// Validates a cache key.
pub fn validate_cache_key(key: &str) -> ValidationResult<()> {
    if key.is_empty() {
        return Err(ValidationError::Required {
            field: "key".to_string(),
        });
    }

    if key.len() > MAX_CACHE_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "key".to_string(),
            max: MAX_CACHE_KEY_LEN,
        });
    }

    Ok(())
}
