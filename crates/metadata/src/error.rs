//! Metadata store error types.

use thiserror::Error;

/// Caller-facing classification of a [`MetadataError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The record is absent or hidden by repository permissions.
    NotFound,
    /// The record is not in a state the operation can start from.
    Conflict,
    /// The request itself is malformed.
    Validation,
    /// Connection or transaction failure; safe to retry with backoff.
    Transient,
    /// The operation would break reference-count safety.
    PolicyViolation,
    Internal,
}

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid state transition for upload {upload_id}: {from} -> {to}")]
    InvalidStateTransition {
        upload_id: i64,
        from: String,
        to: String,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Core(#[from] beacon_core::Error),
}

impl MetadataError {
    pub fn kind(&self) -> ErrorKind {
        use beacon_core::Error as CoreError;
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_)
            | Self::Conflict(_)
            | Self::InvalidStateTransition { .. }
            | Self::Constraint(_) => ErrorKind::Conflict,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Database(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            Self::Database(_) => ErrorKind::Transient,
            Self::PolicyViolation(_) => ErrorKind::PolicyViolation,
            Self::Config(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::Core(CoreError::InvalidTransition { .. }) => ErrorKind::Conflict,
            Self::Core(CoreError::InvalidCommitGraph(_) | CoreError::InvalidRefDescription(_)) => {
                ErrorKind::Internal
            }
            Self::Core(_) => ErrorKind::Validation,
        }
    }

    /// Check if the caller may retry the operation after a backoff.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
