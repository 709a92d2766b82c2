//! Platform OTA partition collaborator seam.

use async_trait::async_trait;

use crate::error::OtaResult;

/// The bootloader-facing flash partition sequence.
///
/// `begin → write → end → set_boot`; any failing step leaves the previous
/// image bootable.
#[async_trait]
pub trait OtaPartition: Send + Sync {
    /// Open the next update partition for an image of `size` bytes.
    async fn begin(&self, size: usize) -> OtaResult<()>;

    /// Write image bytes to the open partition.
    async fn write(&self, data: &[u8]) -> OtaResult<()>;

    /// Finalize the written image.
    async fn end(&self) -> OtaResult<()>;

    /// Mark the written partition as the boot target.
    async fn set_boot(&self) -> OtaResult<()>;
}
