//! Error types for configuration handling.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file could not be written.
    #[error("failed to write config file {path}: {source}")]
    Write {
        /// Path that was being written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A known ECU identifier was expected.
    #[error("unknown ECU id: {0}")]
    UnknownEcu(String),
}

impl ConfigError {
    /// Create a read error.
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    /// Create a write error.
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

/// A specialized `Result` type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
