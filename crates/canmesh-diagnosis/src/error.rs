//! Error types for the diagnosis engine.

use thiserror::Error;

/// Errors surfaced by diagnosis operations.
#[derive(Debug, Error)]
pub enum DiagnosisError {
    /// A transport read failed; the sample was not recorded.
    #[error("CAN transport read failed: {0}")]
    Can(#[from] canmesh_can::CanError),
}

/// A specialized `Result` type for diagnosis operations.
pub type DiagnosisResult<T> = std::result::Result<T, DiagnosisError>;
