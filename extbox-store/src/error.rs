//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error reading a source file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// No script or descriptor under the requested reference.
    #[error("not found: {0}")]
    NotFound(String),

    /// The reference cannot be mapped to a storage location.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// A descriptor file could not be parsed.
    #[error("invalid descriptor {path}: {message}")]
    InvalidDescriptor { path: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}
