//! The supervisor: ordered bring-up and the periodic task set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use canmesh_can::{decode_id, CanConfig, CanDriver, CanError, CanTransport};
use canmesh_config::{ConfigStore, EcuId, MonitorKnobs};
use canmesh_diagnosis::{AlertSink, DiagnosisEngine};
use canmesh_logger::{LogLevel, Logger, LoggerSettings};
use canmesh_ota::{OtaOrchestrator, OtaPartition, UpdateSource};
use canmesh_routing::RoutingLayer;
use canmesh_storage::{KvStore, Rtc, SdStorage};

use crate::collaborators::{MeshRadio, WifiLink};

/// Cadence of the CAN acquisition loop.
const CAN_ACQ_PERIOD: Duration = Duration::from_millis(5);

/// Everything the supervisor needs from the outside world.
pub struct Collaborators {
    /// CAN controller driver.
    pub driver: Arc<dyn CanDriver>,
    /// Fleet update source (MQTT).
    pub source: Arc<dyn UpdateSource>,
    /// SD card storage.
    pub storage: Arc<dyn SdStorage>,
    /// Non-volatile key/value store.
    pub kv: Arc<dyn KvStore>,
    /// Real-time clock.
    pub rtc: Arc<dyn Rtc>,
    /// Platform OTA partition.
    pub partition: Arc<dyn OtaPartition>,
    /// Station Wi-Fi link.
    pub wifi: Arc<dyn WifiLink>,
    /// Mesh radio.
    pub mesh: Arc<dyn MeshRadio>,
}

/// Owner of every component instance and the periodic task set.
pub struct MonitorSupervisor {
    store: Arc<ConfigStore>,
    logger: Arc<Logger>,
    transport: Arc<CanTransport>,
    engine: Arc<DiagnosisEngine>,
    alerts: Arc<AlertSink>,
    routing: Arc<RoutingLayer>,
    ota: Arc<OtaOrchestrator>,
    knobs: MonitorKnobs,
    frames_received: AtomicU64,
    current_time_ms: AtomicU64,
    last_diag_persist_ms: AtomicU64,
    started_at: Instant,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MonitorSupervisor {
    /// Bring the monitor node up.
    ///
    /// Order matters: storage and logger first (everything else logs
    /// through them), then CAN and diagnosis, then connectivity, routing
    /// and OTA. Any failure aborts init.
    pub async fn init(config_path: PathBuf, deps: Collaborators) -> Result<Arc<Self>> {
        info!("initializing monitor ECU");

        deps.storage
            .init()
            .await
            .context("SD storage bring-up failed")?;
        let store = Arc::new(ConfigStore::new(config_path));
        let config = store.load().await.context("config load failed")?;
        let knobs = config.monitor;

        let logger = Logger::new(
            deps.rtc.clone(),
            deps.storage.clone(),
            deps.kv.clone(),
            LoggerSettings {
                directory: "logs".to_string(),
                level: LogLevel::Info,
                max_file_size: config.logger.max_log_file_size,
                free_space_threshold: config.storage.free_space_threshold,
            },
        );
        let restored = logger
            .load_critical_from_nvs()
            .await
            .unwrap_or_else(|err| {
                warn!(%err, "no critical logs restored from NVS");
                0
            });
        if restored > 0 {
            info!(restored, "critical log entries restored from NVS");
        }
        logger.start_flush_task();
        logger.start_async_write_task();
        logger.start_monitor_task();

        let transport = CanTransport::init(deps.driver.clone(), CanConfig::default())
            .await
            .context("CAN transport bring-up failed")?;
        transport.start_transmit_task();

        let engine = DiagnosisEngine::new(transport.clone());
        let alerts = AlertSink::new(deps.rtc.clone(), logger.clone());

        deps.wifi
            .connect()
            .await
            .context("Wi-Fi bring-up failed")?;
        info!("Wi-Fi link established");

        let mesh_events = deps
            .mesh
            .start()
            .await
            .context("mesh radio bring-up failed")?;
        info!("mesh radio started");

        let routing = RoutingLayer::init(store.clone()).await;
        routing.start();

        let ota = OtaOrchestrator::init(
            store.clone(),
            deps.source.clone(),
            deps.storage.clone(),
            routing.clone(),
            deps.partition.clone(),
        )
        .await
        .context("OTA orchestrator bring-up failed")?;

        {
            let logger = logger.clone();
            ota.register_callback(move |event| {
                info!(state = %event.state, ecu = %event.ecu, detail = ?event.detail, "OTA status");
                if matches!(
                    event.state,
                    canmesh_ota::UpdateState::Failure | canmesh_ota::UpdateState::Rollback
                ) {
                    logger.log_alert(
                        LogLevel::Warning,
                        &format!("OTA {} para ECU {}", event.state, event.ecu),
                    );
                }
            })
            .context("OTA status handler registration failed")?;
        }

        let supervisor = Arc::new(Self {
            store,
            logger,
            transport,
            engine,
            alerts,
            routing,
            ota,
            knobs,
            frames_received: AtomicU64::new(0),
            current_time_ms: AtomicU64::new(0),
            last_diag_persist_ms: AtomicU64::new(0),
            started_at: Instant::now(),
            workers: Mutex::new(Vec::new()),
        });

        supervisor.spawn_mesh_forwarder(mesh_events);
        info!(
            max_retry_count = supervisor.knobs.max_retry_count,
            retry_delay_ms = supervisor.knobs.retry_delay_ms,
            "monitor ECU initialized"
        );
        Ok(supervisor)
    }

    /// Spawn the five periodic tasks.
    pub fn start_tasks(self: &Arc<Self>) {
        self.spawn_can_acquisition();
        self.spawn_diagnosis_acquisition();
        self.spawn_communication();
        self.spawn_config_update();
        self.spawn_ota();
        info!("monitor task set running");
    }

    /// Stop every task and tear the transport down.
    pub async fn shutdown(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        self.routing.stop();
        self.logger.stop_tasks();
        if let Err(err) = self.transport.shutdown().await {
            warn!(%err, "CAN transport shutdown failed");
        }
        info!("monitor ECU stopped");
    }

    /// The CAN transport.
    pub fn transport(&self) -> &Arc<CanTransport> {
        &self.transport
    }

    /// The diagnosis engine.
    pub fn engine(&self) -> &Arc<DiagnosisEngine> {
        &self.engine
    }

    /// The alert sink.
    pub fn alerts(&self) -> &Arc<AlertSink> {
        &self.alerts
    }

    /// The persistent logger.
    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    /// The routing layer.
    pub fn routing(&self) -> &Arc<RoutingLayer> {
        &self.routing
    }

    /// The OTA orchestrator.
    pub fn ota(&self) -> &Arc<OtaOrchestrator> {
        &self.ota
    }

    /// The config store.
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Frames drained by the CAN acquisition task.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Milliseconds since supervisor start, as last published by the
    /// diagnosis task. The supervisor is the only writer.
    pub fn current_time_ms(&self) -> u64 {
        self.current_time_ms.load(Ordering::Relaxed)
    }

    fn spawn_mesh_forwarder(
        self: &Arc<Self>,
        mut events: tokio::sync::mpsc::Receiver<canmesh_routing::MeshEvent>,
    ) {
        let routing = self.routing.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(err) = routing.queue_mesh_event(event).await {
                    warn!(%err, "mesh event dropped");
                }
            }
        });
        self.workers.lock().push(handle);
    }

    fn spawn_can_acquisition(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let timeout = Duration::from_millis(u64::from(self.knobs.can_receive_timeout_ms));
        let handle = tokio::spawn(async move {
            loop {
                match supervisor.transport.receive_sync(timeout).await {
                    Ok(frame) => {
                        let total = supervisor.frames_received.fetch_add(1, Ordering::Relaxed) + 1;
                        let (priority, module, command) = decode_id(frame.id);
                        debug!(
                            id = format_args!("0x{:08X}", frame.id),
                            priority,
                            module = format_args!("0x{module:03X}"),
                            command = format_args!("0x{command:04X}"),
                            dlc = frame.dlc,
                            total,
                            "CAN frame acquired"
                        );
                    }
                    Err(CanError::Timeout) => {}
                    Err(err) => warn!(%err, "CAN acquisition receive failed"),
                }
                tokio::time::sleep(CAN_ACQ_PERIOD).await;
            }
        });
        self.workers.lock().push(handle);
    }

    fn spawn_diagnosis_acquisition(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let period = Duration::from_millis(u64::from(self.knobs.diag_acq_interval_ms));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                supervisor.diagnosis_tick().await;
            }
        });
        self.workers.lock().push(handle);
    }

    /// One diagnosis acquisition step: sample, alert, persist if due.
    pub async fn diagnosis_tick(&self) {
        let now_ms = self.started_at.elapsed().as_millis() as u64;
        self.current_time_ms.store(now_ms, Ordering::Relaxed);

        let sample = match self.engine.update().await {
            Ok(sample) => sample,
            Err(err) => {
                warn!(%err, "diagnosis update failed");
                return;
            }
        };
        info!(
            bus_load = sample.bus_load,
            tx_errors = sample.can.tx_error_counter,
            rx_errors = sample.can.rx_error_counter,
            abnormal = sample.abnormal,
            "diagnosis update"
        );
        self.alerts.check_conditions(&sample);

        let last = self.last_diag_persist_ms.load(Ordering::Relaxed);
        let interval = u64::from(self.knobs.diag_persist_interval_ms);
        if sample.abnormal || now_ms.saturating_sub(last) >= interval {
            let summary = sample.summary(now_ms);
            if let Err(err) = self.logger.async_write(&summary).await {
                warn!(%err, "diagnosis summary not persisted");
            } else {
                self.last_diag_persist_ms.store(now_ms, Ordering::Relaxed);
            }
        }
    }

    fn spawn_communication(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let period = Duration::from_millis(u64::from(self.knobs.comm_interval_ms));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                supervisor.routing.recalculate_routes();
            }
        });
        self.workers.lock().push(handle);
    }

    fn spawn_config_update(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let period = Duration::from_millis(u64::from(self.knobs.config_check_interval_ms));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match supervisor.ota.refresh_config().await {
                    Ok(()) => info!("configuration refreshed"),
                    Err(err) => warn!(%err, "configuration refresh failed"),
                }
            }
        });
        self.workers.lock().push(handle);
    }

    fn spawn_ota(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let period = Duration::from_millis(u64::from(self.ota.config().check_interval_ms.max(1)));
        let handle = tokio::spawn(async move {
            loop {
                supervisor.run_ota_cycle().await;
                tokio::time::sleep(period).await;
            }
        });
        self.workers.lock().push(handle);
    }

    /// One OTA cycle: poll for an update and, when one is advertised, run
    /// download → segment → distribute → apply with bounded retries around
    /// each step. Exhausting segment/distribute/apply triggers a rollback.
    pub async fn run_ota_cycle(&self) {
        match self.ota.check_update().await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(%err, "update check failed");
                return;
            }
        }

        let ecu = EcuId::Monitor;

        if self
            .with_retries("download", || self.ota.download_firmware(ecu))
            .await
            .is_none()
        {
            error!(%ecu, "firmware download exhausted its retries, skipping cycle");
            return;
        }

        if self
            .with_retries("segment", || self.ota.segment_firmware())
            .await
            .is_none()
        {
            error!(%ecu, "firmware segmentation exhausted its retries");
            self.trigger_rollback(ecu).await;
            return;
        }

        if self
            .with_retries("distribute", || self.ota.distribute_firmware(ecu))
            .await
            .is_none()
        {
            error!(%ecu, "firmware distribution exhausted its retries");
            self.trigger_rollback(ecu).await;
            return;
        }

        if self
            .with_retries("apply", || self.ota.apply_update(ecu))
            .await
            .is_none()
        {
            error!(%ecu, "firmware apply exhausted its retries");
            self.trigger_rollback(ecu).await;
            return;
        }

        info!(%ecu, "OTA cycle completed");
    }

    async fn trigger_rollback(&self, ecu: EcuId) {
        if let Err(err) = self.ota.rollback_update(ecu).await {
            error!(%err, %ecu, "rollback failed");
        }
    }

    async fn with_retries<F, Fut, T, E>(&self, step: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Some(value),
                Err(err) => {
                    attempt += 1;
                    warn!(step, attempt, %err, "OTA step failed");
                    if attempt >= self.knobs.max_retry_count {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(u64::from(
                        self.knobs.retry_delay_ms,
                    )))
                    .await;
                }
            }
        }
    }
}

impl std::fmt::Debug for MonitorSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSupervisor")
            .field("knobs", &self.knobs)
            .field("frames_received", &self.frames_received())
            .finish()
    }
}
