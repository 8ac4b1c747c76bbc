//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid upload state: {0}")]
    InvalidUploadState(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("invalid part index {index} (upload declares {num_parts} parts)")]
    InvalidPartIndex { index: i64, num_parts: i64 },

    #[error("invalid commit graph: {0}")]
    InvalidCommitGraph(String),

    #[error("invalid ref description: {0}")]
    InvalidRefDescription(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
