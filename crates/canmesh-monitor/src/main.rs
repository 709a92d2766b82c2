//! Monitor node daemon (canmeshd).
//!
//! Runs the supervisor against the bench-rig collaborators: an in-process
//! CAN controller, an idle update source and an always-up Wi-Fi link. On
//! the vehicle the same supervisor is linked against the hardware
//! drivers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use canmesh_can::testing::MockDriver;
use canmesh_monitor::bench::{BenchMesh, BenchWifi};
use canmesh_monitor::{Collaborators, MonitorSupervisor};
use canmesh_ota::testing::{MockPartition, MockUpdateSource};
use canmesh_storage::{DirStorage, FileKvStore, SdStorage, SystemRtc};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("canmesh=debug,info")),
        )
        .init();

    info!("starting canmeshd v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./canmesh-data"));
    info!(data_dir = %data_dir.display(), "using data directory");

    let storage = Arc::new(DirStorage::new(&data_dir));
    storage
        .init()
        .await
        .context("data directory bring-up failed")?;
    let kv = Arc::new(
        FileKvStore::open(data_dir.join("nvs.json"))
            .await
            .context("NVS store bring-up failed")?,
    );
    let rtc = Arc::new(SystemRtc);

    let source = Arc::new(MockUpdateSource::new(storage.clone()));
    let (mesh, _mesh_events) = BenchMesh::new();

    let deps = Collaborators {
        driver: Arc::new(MockDriver::new()),
        source,
        storage,
        kv,
        rtc,
        partition: Arc::new(MockPartition::new()),
        wifi: Arc::new(BenchWifi),
        mesh: Arc::new(mesh),
    };

    let supervisor = MonitorSupervisor::init(data_dir.join("config.ini"), deps)
        .await
        .context("monitor bring-up failed")?;
    supervisor.start_tasks();

    tokio::signal::ctrl_c()
        .await
        .context("signal handler failed")?;
    info!("shutdown signal received");

    supervisor.shutdown().await;
    info!("canmeshd stopped");
    Ok(())
}
