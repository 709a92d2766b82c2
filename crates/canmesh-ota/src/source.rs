//! Update source (MQTT) collaborator seam.

use async_trait::async_trait;

use crate::error::OtaResult;

/// The fleet-side update channel.
///
/// On the node this is the MQTT client; firmware downloads land on the SD
/// card under the filename the orchestrator asks for.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Subscribe to an update topic.
    async fn subscribe(&self, topic: &str) -> OtaResult<()>;

    /// Publish a payload on a topic.
    async fn publish(&self, topic: &str, payload: &[u8]) -> OtaResult<()>;

    /// Advertised firmware version on a topic, `None` when nothing is
    /// advertised.
    async fn update_version(&self, topic: &str) -> OtaResult<Option<u32>>;

    /// Download the advertised firmware of a topic onto the SD card under
    /// `filename`.
    async fn download_file(&self, topic: &str, filename: &str) -> OtaResult<()>;
}
