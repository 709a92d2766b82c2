//! Error types for the storage seams.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the storage collaborators.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("storage I/O on {path}: {source}")]
    Io {
        /// Path involved in the failing operation.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A requested file does not exist.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    /// Blob (de)serialization failed.
    #[error("blob serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StorageError {
    /// Create an I/O error, collapsing `NotFound` into its own variant.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// A specialized `Result` type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
