//! Connectivity collaborator seams owned by the supervisor.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use canmesh_routing::MeshEvent;

/// The station-mode Wi-Fi link.
///
/// Bring-up is opaque to the supervisor; only success matters.
/// Reconnection and credential policy belong to the implementation.
#[async_trait]
pub trait WifiLink: Send + Sync {
    /// Connect the station. Called once during supervisor init.
    async fn connect(&self) -> Result<()>;
}

/// The mesh radio.
///
/// Starting the radio yields the stream of topology events the supervisor
/// forwards into the routing layer.
#[async_trait]
pub trait MeshRadio: Send + Sync {
    /// Start the radio and return its topology-event stream.
    async fn start(&self) -> Result<mpsc::Receiver<MeshEvent>>;
}
