//! Error contract of the CAN transport boundary.

use thiserror::Error;

/// Errors surfaced by the CAN transport and driver seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanError {
    /// Payload too large, or no room left for the checksum byte.
    #[error("invalid payload length {0}")]
    InvalidLength(usize),

    /// The driver failed to put the frame on the bus.
    #[error("transmit failed for frame 0x{0:08X}")]
    Transmit(u32),

    /// The driver failed on receive, or the checksum did not verify.
    #[error("receive failed: {0}")]
    Receive(String),

    /// A bounded wait expired. Non-fatal; the caller decides.
    #[error("operation timed out")]
    Timeout,

    /// Driver installation failed. Fatal at init.
    #[error("driver install failed: {0}")]
    DriverInstall(String),

    /// Driver start failed. Fatal at init.
    #[error("driver start failed: {0}")]
    DriverStart(String),

    /// Driver stop failed during teardown or reconfiguration.
    #[error("driver stop failed: {0}")]
    DriverStop(String),

    /// Driver uninstall failed during teardown or reconfiguration.
    #[error("driver uninstall failed: {0}")]
    DriverUninstall(String),

    /// The TX queue was torn down while a producer was waiting.
    #[error("transmit queue closed")]
    QueueClosed,

    /// Everything else.
    #[error("CAN error: {0}")]
    Unknown(String),
}

impl CanError {
    /// Create a receive error.
    pub fn receive(reason: impl Into<String>) -> Self {
        Self::Receive(reason.into())
    }

    /// Create an unknown error.
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::Unknown(reason.into())
    }

    /// Whether this error is a non-fatal timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CanError::Timeout)
    }
}

/// A specialized `Result` type for CAN operations.
pub type CanResult<T> = std::result::Result<T, CanError>;
