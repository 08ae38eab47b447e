//! Error types for contactlink.
//!
//! All errors are strongly typed using thiserror. Validation failures never
//! touch the store; storage failures abort the surrounding transaction.

use thiserror::Error;

use crate::storage::StorageError;

/// Validation errors raised while checking an identify request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("At least one of email or phoneNumber is required")]
    MissingIdentifier,

    #[error("Invalid email address: {value}")]
    InvalidEmail {
        value: String,
    },

    #[error("Invalid phone number '{value}': {reason}")]
    InvalidPhoneNumber {
        value: String,
        reason: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    FieldTooLong {
        field: String,
        max_length: usize,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

impl ValidationError {
    /// Returns true when the request carried no identifier at all.
    ///
    /// The HTTP layer reports this as `400`; every other validation failure is
    /// a malformed field and maps to `422`.
    #[must_use]
    pub const fn is_missing_identifier(&self) -> bool {
        matches!(self, Self::MissingIdentifier)
    }
}

/// Top-level error type for contactlink.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The submission was rejected before touching the store.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The transaction failed and was rolled back.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The caller gave up before commit.
    #[error("Request cancelled before commit")]
    Cancelled,

    /// A bug: an invariant the resolver relies on did not hold.
    #[error("Internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl LinkError {
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

    /// Returns true if this is a storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this error is retryable.
    ///
    /// Only write-write serialization conflicts qualify: the transaction that
    /// raised them was rolled back and a fresh attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(StorageError::SerializationConflict(_)))
    }
}

/// Result type alias for contactlink operations.
pub type LinkResult<T> = Result<T, LinkError>;
