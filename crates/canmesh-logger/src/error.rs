//! Error types for the persistent logger.

use thiserror::Error;

/// Errors surfaced by logger operations.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// A storage collaborator failed.
    #[error(transparent)]
    Storage(#[from] canmesh_storage::StorageError),

    /// Entry (de)serialization for the NVS blob failed.
    #[error("log serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The async-write queue is gone; the writer task was never started or
    /// has been torn down.
    #[error("async write queue closed")]
    QueueClosed,

    /// SD persistence kept failing after the local retries.
    #[error("persisting logs to SD failed after {attempts} attempts")]
    SdExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
}

/// A specialized `Result` type for logger operations.
pub type LoggerResult<T> = std::result::Result<T, LoggerError>;
