//! Bench-rig connectivity collaborators.
//!
//! Stand-ins for running the monitor off-vehicle: the Wi-Fi link always
//! connects and the mesh radio emits whatever topology events the bench
//! injects through its handle. The CAN driver, update source and
//! partition stand-ins live in their component crates' `testing` modules.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::info;

use canmesh_routing::MeshEvent;

use crate::collaborators::{MeshRadio, WifiLink};

/// Wi-Fi link that is always up.
#[derive(Debug, Default)]
pub struct BenchWifi;

#[async_trait]
impl WifiLink for BenchWifi {
    async fn connect(&self) -> Result<()> {
        info!("bench Wi-Fi link up");
        Ok(())
    }
}

/// Mesh radio fed by the bench.
///
/// `BenchMesh::new` returns the radio and a sender the bench uses to
/// inject topology events.
#[derive(Debug)]
pub struct BenchMesh {
    events: Mutex<Option<mpsc::Receiver<MeshEvent>>>,
}

impl BenchMesh {
    /// Create a radio and the event-injection handle.
    pub fn new() -> (Self, mpsc::Sender<MeshEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                events: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl MeshRadio for BenchMesh {
    async fn start(&self) -> Result<mpsc::Receiver<MeshEvent>> {
        self.events
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("bench mesh radio already started"))
    }
}
