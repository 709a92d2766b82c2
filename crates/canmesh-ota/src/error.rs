//! Error types for the OTA orchestrator.

use thiserror::Error;

/// Errors surfaced by OTA operations.
#[derive(Debug, Error)]
pub enum OtaError {
    /// A second update was started while one is alive.
    #[error("an update is already in progress")]
    UpdateInProgress,

    /// The update source could not provide what was asked of it.
    #[error("update source failure: {0}")]
    Source(String),

    /// Missing or empty firmware input.
    #[error("invalid firmware input: {0}")]
    InvalidInput(&'static str),

    /// SD storage failed.
    #[error(transparent)]
    Storage(#[from] canmesh_storage::StorageError),

    /// Segment distribution over the routing layer failed.
    #[error("segment distribution failed: {0}")]
    Distribute(#[from] canmesh_routing::RoutingError),

    /// The platform partition rejected a step of the apply sequence.
    #[error("partition operation failed: {0}")]
    Partition(String),

    /// Persisting the OTA configuration failed.
    #[error(transparent)]
    Persist(#[from] canmesh_config::ConfigError),

    /// The subscriber registry is full.
    #[error("maximum number of OTA subscribers reached")]
    SubscribersFull,
}

impl OtaError {
    /// Create an update-source error.
    pub fn source(reason: impl Into<String>) -> Self {
        Self::Source(reason.into())
    }

    /// Create a partition error.
    pub fn partition(reason: impl Into<String>) -> Self {
        Self::Partition(reason.into())
    }
}

/// A specialized `Result` type for OTA operations.
pub type OtaResult<T> = std::result::Result<T, OtaError>;
