//! Error types for leadgraph.
//!
//! All errors are strongly typed using thiserror so callers (ingestion
//! endpoints) can map each condition onto a response without string
//! matching.

use thiserror::Error;

use crate::config::ConfigError;
use crate::customer::CustomerId;
use crate::identifier::IdentifierType;
use crate::storage::StorageError;

/// Validation errors that occur before any store is touched.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// No identifier survived normalization.
    #[error("Identifier bundle contains no usable identifiers")]
    EmptyBundle,

    /// A value is longer than `max_identifier_length`.
    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        /// Offending field.
        field: String,
        /// Limit in characters.
        max_length: usize,
    },

    /// Revenue is negative, NaN or infinite.
    #[error("Revenue {value} must be finite and non-negative")]
    InvalidRevenue {
        /// Rejected amount.
        value: f64,
    },

    /// Event name is blank.
    #[error("Event name cannot be empty")]
    EmptyEventName,

    /// Only email and phone can be verified.
    #[error("Identifiers of type {identifier_type} are verified on creation")]
    NotVerifiable {
        /// Identifier type.
        identifier_type: IdentifierType,
    },
}

/// Top-level error type for leadgraph.
#[derive(Debug, Error)]
pub enum LeadGraphError {
    /// Input rejected.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// An identifier is owned by a different customer than the one being
    /// updated. Never merged automatically; callers log it for review.
    #[error("Identifier {identifier_type}:{value} is owned by customer {owner}, not {expected}")]
    Conflict {
        /// Identifier type.
        identifier_type: IdentifierType,
        /// Identifier value.
        value: String,
        /// Current owner.
        owner: CustomerId,
        /// Customer the bundle resolved to.
        expected: CustomerId,
    },

    /// Bad configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bug or broken invariant.
    #[error("Internal error: {message}")]
    Internal {
        /// Details.
        message: String,
    },
}

impl LeadGraphError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an ownership conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if the caller may retry the request later.
    ///
    /// Only connection-level storage failures qualify; identifier races are
    /// already retried inside the resolver.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(StorageError::ConnectionError(_)))
    }
}

/// Result type alias for leadgraph operations.
pub type LeadGraphResult<T> = Result<T, LeadGraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_empty_bundle() {
        let err = ValidationError::EmptyBundle;
        assert!(err.to_string().contains("no usable identifiers"));
    }

    #[test]
    fn test_validation_error_field_too_long() {
        let err = ValidationError::FieldTooLong {
            field: "email".to_string(),
            max_length: 512,
        };
        let msg = format!("{err}");
        assert!(msg.contains("email"));
        assert!(msg.contains("512"));
    }

    #[test]
    fn test_conflict_display() {
        let owner = CustomerId::new();
        let expected = CustomerId::new();
        let err = LeadGraphError::Conflict {
            identifier_type: IdentifierType::DeviceId,
            value: "d1".to_string(),
            owner,
            expected,
        };
        let msg = format!("{err}");
        assert!(msg.contains("DEVICE_ID:d1"));
        assert!(msg.contains(&owner.to_string()));
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_from_validation() {
        let err: LeadGraphError = ValidationError::EmptyEventName.into();
        assert!(err.is_validation());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_retryable() {
        let err: LeadGraphError = StorageError::ConnectionError("reset".to_string()).into();
        assert!(err.is_storage());
        assert!(err.is_retryable());

        let err: LeadGraphError = StorageError::BackendError("disk full".to_string()).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal() {
        let err = LeadGraphError::internal("unexpected state");
        let msg = format!("{err}");
        assert!(msg.contains("unexpected state"));
    }
}
