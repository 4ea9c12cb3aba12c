//! Error types for segment merging.

use thiserror::Error;

/// The error type for all merge operations.
#[derive(Error, Debug)]
pub enum MergeError {
    /// I/O error while reading or writing merge artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error for persisted plans and task items.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A caller supplied an argument that violates a precondition.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A value lies outside the range the operation accepts.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Invalid merge configuration.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A segment, file or resource was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persisted data failed validation.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// A scheduled work item failed.
    #[error("Work item failed: {0}")]
    WorkItem(String),

    /// Internal invariant broken.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl MergeError {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        MergeError::InvalidArgument(msg.into())
    }

    pub fn out_of_range<S: Into<String>>(msg: S) -> Self {
        MergeError::OutOfRange(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        MergeError::InvalidConfig(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        MergeError::NotFound(msg.into())
    }

    pub fn corrupted<S: Into<String>>(msg: S) -> Self {
        MergeError::Corrupted(msg.into())
    }

    pub fn work_item<S: Into<String>>(msg: S) -> Self {
        MergeError::WorkItem(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        MergeError::Internal(msg.into())
    }

    pub fn other<S: Into<String>>(msg: S) -> Self {
        MergeError::Other(msg.into())
    }
}

/// Result type alias for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
