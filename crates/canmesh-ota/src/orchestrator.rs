//! The per-ECU update pipeline.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use canmesh_config::{ConfigStore, EcuId, OtaConfig};
use canmesh_routing::{RoutingLayer, SendMode};
use canmesh_storage::SdStorage;

use crate::error::{OtaError, OtaResult};
use crate::partition::OtaPartition;
use crate::segment::{segment_bounds, FirmwareSegments};
use crate::source::UpdateSource;
use crate::state::UpdateState;

/// Maximum number of registered OTA event subscribers.
pub const MAX_OTA_SUBSCRIBERS: usize = 5;

/// Event delivered to subscribers on every state transition.
#[derive(Debug, Clone)]
pub struct OtaEvent {
    /// State entered.
    pub state: UpdateState,
    /// ECU the update targets.
    pub ecu: EcuId,
    /// Optional human-readable context.
    pub detail: Option<String>,
}

type Subscriber = Arc<dyn Fn(&OtaEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct OtaContext {
    state: UpdateState,
    current_ecu: Option<EcuId>,
    pending_version: Option<u32>,
    firmware: Option<Vec<u8>>,
    segment_bounds: Option<Vec<(usize, usize)>>,
    in_progress: bool,
    rollback_in_progress: bool,
}

/// Orchestrates download, segmentation, distribution and apply of a
/// firmware update for one ECU at a time.
///
/// The context is serialized behind one async mutex; while an update is in
/// a non-idle state, a second update for any ECU is refused. Retry policy
/// lives in the supervisor.
pub struct OtaOrchestrator {
    store: Arc<ConfigStore>,
    source: Arc<dyn UpdateSource>,
    storage: Arc<dyn SdStorage>,
    routing: Arc<RoutingLayer>,
    partition: Arc<dyn OtaPartition>,
    config: Mutex<OtaConfig>,
    ctx: AsyncMutex<OtaContext>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl OtaOrchestrator {
    /// Load the OTA configuration and subscribe to every ECU topic.
    ///
    /// # Errors
    ///
    /// Fails when a topic subscription is refused; the supervisor aborts
    /// init in that case.
    pub async fn init(
        store: Arc<ConfigStore>,
        source: Arc<dyn UpdateSource>,
        storage: Arc<dyn SdStorage>,
        routing: Arc<RoutingLayer>,
        partition: Arc<dyn OtaPartition>,
    ) -> OtaResult<Arc<Self>> {
        let config = match store.load().await {
            Ok(config) => config.ota,
            Err(err) => {
                warn!(%err, "OTA config unavailable, using defaults");
                OtaConfig::default()
            }
        };

        for ecu in EcuId::ALL {
            source.subscribe(config.topic(ecu)).await?;
        }
        info!(
            check_interval_ms = config.check_interval_ms,
            "OTA orchestrator initialized"
        );

        Ok(Arc::new(Self {
            store,
            source,
            storage,
            routing,
            partition,
            config: Mutex::new(config),
            ctx: AsyncMutex::new(OtaContext::default()),
            subscribers: RwLock::new(Vec::new()),
        }))
    }

    /// Register an event subscriber.
    ///
    /// # Errors
    ///
    /// At most [`MAX_OTA_SUBSCRIBERS`] subscribers are accepted.
    pub fn register_callback<F>(&self, callback: F) -> OtaResult<()>
    where
        F: Fn(&OtaEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self.subscribers.write();
        if subscribers.len() >= MAX_OTA_SUBSCRIBERS {
            return Err(OtaError::SubscribersFull);
        }
        subscribers.push(Arc::new(callback));
        Ok(())
    }

    /// Poll the update source for the monitor ECU's advertised version.
    ///
    /// Returns whether an update is available; if so the context moves to
    /// `UpdateAvailable` and subscribers are notified.
    pub async fn check_update(&self) -> OtaResult<bool> {
        let topic = self.config.lock().topic(EcuId::Monitor).to_string();
        match self.source.update_version(&topic).await? {
            Some(version) => self.check_version(EcuId::Monitor, version).await,
            None => {
                warn!(%topic, "no advertised firmware version");
                Ok(false)
            }
        }
    }

    /// Compare an advertised version against the installed one for an ECU.
    pub async fn check_version(&self, ecu: EcuId, available: u32) -> OtaResult<bool> {
        let installed = self.config.lock().installed_version(ecu);
        info!(%ecu, installed, available, "firmware version check");
        if available <= installed {
            return Ok(false);
        }

        {
            let mut ctx = self.ctx.lock().await;
            ctx.state = UpdateState::UpdateAvailable;
            ctx.current_ecu = Some(ecu);
            ctx.pending_version = Some(available);
        }
        self.notify(
            UpdateState::UpdateAvailable,
            ecu,
            Some(format!("version {available}")),
        );
        Ok(true)
    }

    /// Download the advertised firmware for an ECU and load it into the
    /// update buffer.
    ///
    /// The image lands on the SD card under the canonical
    /// `firmware_<ecu>_v<version>.bin` name first.
    ///
    /// # Errors
    ///
    /// Refused while another update is in progress; any collaborator
    /// failure moves the context to `Failure` and clears the in-progress
    /// flag.
    pub async fn download_firmware(&self, ecu: EcuId) -> OtaResult<()> {
        let mut ctx = self.ctx.lock().await;
        if ctx.in_progress {
            warn!(%ecu, "update already in progress, download refused");
            return Err(OtaError::UpdateInProgress);
        }
        ctx.in_progress = true;
        ctx.current_ecu = Some(ecu);
        self.set_state(&mut ctx, UpdateState::Downloading, ecu, None);

        let (topic, version) = {
            let config = self.config.lock();
            let version = ctx
                .pending_version
                .unwrap_or_else(|| config.installed_version(ecu));
            (config.topic(ecu).to_string(), version)
        };
        let filename = ecu.firmware_filename(version);
        info!(%topic, %filename, "downloading firmware");

        if let Err(err) = self.source.download_file(&topic, &filename).await {
            error!(%err, %ecu, "firmware download failed");
            self.fail_and_reset(&mut ctx, ecu, "firmware download failed");
            return Err(err);
        }

        match self.storage.read_file(&filename).await {
            Ok(image) if !image.is_empty() => {
                info!(bytes = image.len(), %filename, "firmware image loaded");
                ctx.firmware = Some(image);
                Ok(())
            }
            Ok(_) => {
                self.fail_and_reset(&mut ctx, ecu, "downloaded firmware is empty");
                Err(OtaError::InvalidInput("downloaded firmware is empty"))
            }
            Err(err) => {
                error!(%err, %filename, "firmware image load failed");
                self.fail_and_reset(&mut ctx, ecu, "firmware image load failed");
                Err(err.into())
            }
        }
    }

    /// Segment the loaded firmware into 1 KiB distribution packets.
    ///
    /// Returns the segment count. The descriptors borrow the update
    /// buffer; nothing is copied.
    pub async fn segment_firmware(&self) -> OtaResult<usize> {
        let mut ctx = self.ctx.lock().await;
        let size = match ctx.firmware.as_ref() {
            Some(image) => image.len(),
            None => return Err(OtaError::InvalidInput("no firmware loaded")),
        };
        let bounds = segment_bounds(size)?;
        let count = bounds.len();
        ctx.segment_bounds = Some(bounds);
        info!(count, size, "firmware segmented");
        Ok(count)
    }

    /// Send every segment to the target ECU as a unicast mesh message.
    ///
    /// Segment descriptors are consumed whether or not distribution
    /// succeeds; a failed send aborts and moves the context to `Failure`.
    pub async fn distribute_firmware(&self, ecu: EcuId) -> OtaResult<()> {
        let mut ctx = self.ctx.lock().await;
        let bounds = ctx
            .segment_bounds
            .take()
            .ok_or(OtaError::InvalidInput("firmware not segmented"))?;
        if ctx.firmware.is_none() {
            return Err(OtaError::InvalidInput("no firmware loaded"));
        }
        self.set_state(&mut ctx, UpdateState::Distributing, ecu, None);

        let send_result = {
            let image = ctx.firmware.as_deref().unwrap_or_default();
            let segments = FirmwareSegments::from_bounds(image, bounds);
            let mut failure = None;
            for (index, segment) in segments.iter().enumerate() {
                if let Err(err) = self
                    .routing
                    .send_message(ecu.as_str(), segment, SendMode::Unicast)
                    .await
                {
                    error!(index, %ecu, "firmware segment send failed");
                    failure = Some(err);
                    break;
                }
            }
            match failure {
                Some(err) => Err(err),
                None => Ok(segments.len()),
            }
        };

        match send_result {
            Ok(count) => {
                info!(segments = count, %ecu, "firmware distribution complete");
                Ok(())
            }
            Err(err) => {
                self.set_state(
                    &mut ctx,
                    UpdateState::Failure,
                    ecu,
                    Some("segment distribution failed".to_string()),
                );
                Err(err.into())
            }
        }
    }

    /// Hand the loaded firmware to the platform partition.
    ///
    /// On success the installed version is bumped, persisted to
    /// `config.ini`, and the update buffer is released. Any failing step
    /// moves the context to `Failure` and triggers a rollback.
    pub async fn apply_update(&self, ecu: EcuId) -> OtaResult<()> {
        let mut ctx = self.ctx.lock().await;
        if ctx.firmware.is_none() {
            return Err(OtaError::InvalidInput("no firmware loaded"));
        }
        self.set_state(&mut ctx, UpdateState::Applying, ecu, None);

        let apply_result = {
            let image = ctx.firmware.as_deref().unwrap_or_default();
            self.flash_image(image).await
        };

        if let Err(err) = apply_result {
            error!(%err, %ecu, "firmware apply failed");
            self.set_state(
                &mut ctx,
                UpdateState::Failure,
                ecu,
                Some(err.to_string()),
            );
            self.do_rollback(&mut ctx, ecu);
            return Err(err);
        }

        let new_version = {
            let mut config = self.config.lock();
            let version = ctx
                .pending_version
                .take()
                .unwrap_or_else(|| config.installed_version(ecu));
            config.set_installed_version(ecu, version);
            version
        };
        self.set_state(
            &mut ctx,
            UpdateState::Success,
            ecu,
            Some(format!("version {new_version}")),
        );

        if let Err(err) = self.update_config().await {
            warn!(%err, "failed to persist OTA configuration after update");
        }

        ctx.firmware = None;
        ctx.in_progress = false;
        ctx.state = UpdateState::Idle;
        info!(%ecu, new_version, "firmware update committed");
        Ok(())
    }

    /// Roll back to the previously installed firmware.
    ///
    /// The outcome is reported through the notification channel only.
    pub async fn rollback_update(&self, ecu: EcuId) -> OtaResult<()> {
        let mut ctx = self.ctx.lock().await;
        warn!(%ecu, "initiating firmware rollback");
        self.do_rollback(&mut ctx, ecu);
        Ok(())
    }

    /// Persist the in-memory OTA configuration to `config.ini`.
    pub async fn update_config(&self) -> OtaResult<()> {
        let snapshot = self.config.lock().clone();
        self.store.update_ota(snapshot).await?;
        Ok(())
    }

    /// Re-read the OTA key group from `config.ini` without a restart.
    pub async fn refresh_config(&self) -> OtaResult<()> {
        let loaded = self.store.load().await?;
        *self.config.lock() = loaded.ota;
        info!("OTA configuration refreshed");
        Ok(())
    }

    /// Delete a firmware image from the SD card.
    pub async fn delete_firmware(&self, filename: &str) -> OtaResult<()> {
        self.storage.delete_file(filename).await?;
        info!(filename, "firmware image deleted");
        Ok(())
    }

    /// Current pipeline state.
    pub async fn state(&self) -> UpdateState {
        self.ctx.lock().await.state
    }

    /// Installed firmware version of an ECU.
    pub fn installed_version(&self, ecu: EcuId) -> u32 {
        self.config.lock().installed_version(ecu)
    }

    /// Snapshot of the OTA configuration.
    pub fn config(&self) -> OtaConfig {
        self.config.lock().clone()
    }

    fn set_state(&self, ctx: &mut OtaContext, state: UpdateState, ecu: EcuId, detail: Option<String>) {
        ctx.state = state;
        self.notify(state, ecu, detail);
    }

    fn fail_and_reset(&self, ctx: &mut OtaContext, ecu: EcuId, detail: &str) {
        self.set_state(ctx, UpdateState::Failure, ecu, Some(detail.to_string()));
        ctx.state = UpdateState::Idle;
        ctx.in_progress = false;
        ctx.firmware = None;
    }

    // The update buffer and pending version survive a rollback so the
    // supervisor can retry the apply step against the same image.
    fn do_rollback(&self, ctx: &mut OtaContext, ecu: EcuId) {
        ctx.rollback_in_progress = true;
        self.set_state(ctx, UpdateState::Rollback, ecu, None);
        ctx.state = UpdateState::Idle;
        ctx.in_progress = false;
        ctx.rollback_in_progress = false;
        info!(%ecu, "rollback signalled, context reset");
    }

    async fn flash_image(&self, image: &[u8]) -> OtaResult<()> {
        self.partition.begin(image.len()).await?;
        self.partition.write(image).await?;
        self.partition.end().await?;
        self.partition.set_boot().await?;
        Ok(())
    }

    fn notify(&self, state: UpdateState, ecu: EcuId, detail: Option<String>) {
        let event = OtaEvent { state, ecu, detail };
        let subscribers = self.subscribers.read().clone();
        for subscriber in &subscribers {
            subscriber(&event);
        }
    }
}

impl std::fmt::Debug for OtaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtaOrchestrator")
            .field("config", &*self.config.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPartition, MockUpdateSource};
    use canmesh_routing::{NeighborEntry, NeighborTable, RoutingEvent};
    use canmesh_storage::testing::MemorySdStorage;
    use parking_lot::Mutex as SyncMutex;

    struct Fixture {
        orchestrator: Arc<OtaOrchestrator>,
        source: Arc<MockUpdateSource>,
        storage: Arc<MemorySdStorage>,
        routing: Arc<RoutingLayer>,
        partition: Arc<MockPartition>,
        store: Arc<ConfigStore>,
        events: Arc<SyncMutex<Vec<OtaEvent>>>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::new(dir.path().join("config.ini")));
        let storage = Arc::new(MemorySdStorage::new());
        let source = Arc::new(MockUpdateSource::new(storage.clone()));
        let routing = RoutingLayer::init(store.clone()).await;
        let partition = Arc::new(MockPartition::new());

        let orchestrator = OtaOrchestrator::init(
            store.clone(),
            source.clone(),
            storage.clone(),
            routing.clone(),
            partition.clone(),
        )
        .await
        .unwrap();

        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink = events.clone();
        orchestrator
            .register_callback(move |event| sink.lock().push(event.clone()))
            .unwrap();

        Fixture {
            orchestrator,
            source,
            storage,
            routing,
            partition,
            store,
            events,
            _dir: dir,
        }
    }

    fn states(events: &SyncMutex<Vec<OtaEvent>>) -> Vec<UpdateState> {
        events.lock().iter().map(|e| e.state).collect()
    }

    #[tokio::test]
    async fn init_subscribes_every_ecu_topic() {
        let f = fixture().await;
        assert_eq!(f.source.subscriptions().len(), EcuId::ALL.len());
    }

    #[tokio::test]
    async fn check_update_without_advertisement_is_false() {
        let f = fixture().await;
        assert!(!f.orchestrator.check_update().await.unwrap());
        assert_eq!(f.orchestrator.state().await, UpdateState::Idle);
    }

    #[tokio::test]
    async fn check_update_ignores_non_newer_versions() {
        let f = fixture().await;
        let topic = f.orchestrator.config().topic_monitor.clone();
        f.source.advertise(&topic, 1, vec![1, 2, 3]);
        assert!(!f.orchestrator.check_update().await.unwrap());
    }

    #[tokio::test]
    async fn full_pipeline_commits_the_advertised_version() {
        let f = fixture().await;
        let image: Vec<u8> = (0..2_500u32).map(|i| i as u8).collect();
        let topic = f.orchestrator.config().topic_monitor.clone();
        f.source.advertise(&topic, 2, image.clone());

        // Give the mesh a route to the monitor ECU and watch for failures.
        f.routing.update_topology(&NeighborTable::from_entries([NeighborEntry {
            id: "monitor_ecu".to_string(),
            rssi: -40,
            link_quality: 230,
        }]));
        let failures = Arc::new(SyncMutex::new(0u32));
        let counter = failures.clone();
        f.routing.register_callback(move |event| {
            if matches!(event, RoutingEvent::RouteFailure(_)) {
                *counter.lock() += 1;
            }
        });
        f.routing.start();

        assert!(f.orchestrator.check_update().await.unwrap());
        f.orchestrator.download_firmware(EcuId::Monitor).await.unwrap();
        assert!(f.storage.file("firmware_monitor_ecu_v2.bin").is_some());

        assert_eq!(f.orchestrator.segment_firmware().await.unwrap(), 3);
        f.orchestrator
            .distribute_firmware(EcuId::Monitor)
            .await
            .unwrap();
        f.orchestrator.apply_update(EcuId::Monitor).await.unwrap();

        assert_eq!(f.partition.written(), image);
        assert!(f.partition.boot_set());
        assert_eq!(f.orchestrator.installed_version(EcuId::Monitor), 2);
        assert_eq!(f.orchestrator.state().await, UpdateState::Idle);

        // The new version is durable.
        let persisted = f.store.load().await.unwrap();
        assert_eq!(persisted.ota.firmware_version_monitor, 2);

        assert_eq!(
            states(&f.events),
            vec![
                UpdateState::UpdateAvailable,
                UpdateState::Downloading,
                UpdateState::Distributing,
                UpdateState::Applying,
                UpdateState::Success,
            ]
        );
        assert_eq!(*failures.lock(), 0);
        f.routing.stop();
    }

    #[tokio::test]
    async fn second_download_is_refused_while_in_progress() {
        let f = fixture().await;
        let topic = f.orchestrator.config().topic_monitor.clone();
        f.source.advertise(&topic, 2, vec![0u8; 100]);

        f.orchestrator.check_version(EcuId::Monitor, 2).await.unwrap();
        f.orchestrator.download_firmware(EcuId::Monitor).await.unwrap();

        let err = f
            .orchestrator
            .download_firmware(EcuId::BrakeControl)
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::UpdateInProgress));
    }

    #[tokio::test]
    async fn download_failure_reports_failure_and_clears_in_progress() {
        let f = fixture().await;
        let topic = f.orchestrator.config().topic_monitor.clone();
        f.source.advertise(&topic, 2, vec![0u8; 100]);
        f.source.fail_next_downloads(1);

        f.orchestrator.check_version(EcuId::Monitor, 2).await.unwrap();
        let err = f
            .orchestrator
            .download_firmware(EcuId::Monitor)
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::Source(_)));
        assert!(states(&f.events).contains(&UpdateState::Failure));

        // The context is idle again: a fresh download goes through.
        f.orchestrator.download_firmware(EcuId::Monitor).await.unwrap();
    }

    #[tokio::test]
    async fn apply_failure_rolls_back() {
        let f = fixture().await;
        let topic = f.orchestrator.config().topic_monitor.clone();
        f.source.advertise(&topic, 3, vec![7u8; 64]);
        f.partition.fail_step("write");

        f.orchestrator.check_version(EcuId::Monitor, 3).await.unwrap();
        f.orchestrator.download_firmware(EcuId::Monitor).await.unwrap();
        let err = f.orchestrator.apply_update(EcuId::Monitor).await.unwrap_err();
        assert!(matches!(err, OtaError::Partition(_)));

        let observed = states(&f.events);
        assert!(observed.contains(&UpdateState::Failure));
        assert!(observed.contains(&UpdateState::Rollback));
        assert_eq!(f.orchestrator.state().await, UpdateState::Idle);
        // The installed version did not move.
        assert_eq!(f.orchestrator.installed_version(EcuId::Monitor), 1);
    }

    #[tokio::test]
    async fn distribute_requires_prior_segmentation() {
        let f = fixture().await;
        let err = f
            .orchestrator
            .distribute_firmware(EcuId::Monitor)
            .await
            .unwrap_err();
        assert!(matches!(err, OtaError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn subscriber_registry_is_capped() {
        let f = fixture().await;
        // One subscriber is registered by the fixture.
        for _ in 0..(MAX_OTA_SUBSCRIBERS - 1) {
            f.orchestrator.register_callback(|_| {}).unwrap();
        }
        let err = f.orchestrator.register_callback(|_| {}).unwrap_err();
        assert!(matches!(err, OtaError::SubscribersFull));
    }

    #[tokio::test]
    async fn refresh_config_reloads_the_persisted_keys() {
        let f = fixture().await;
        f.store
            .update(|config| config.ota.firmware_version_brake = 9)
            .await
            .unwrap();
        f.orchestrator.refresh_config().await.unwrap();
        assert_eq!(f.orchestrator.installed_version(EcuId::BrakeControl), 9);
    }

    #[tokio::test]
    async fn delete_firmware_removes_the_image() {
        let f = fixture().await;
        f.storage.insert_file("firmware_monitor_ecu_v1.bin", vec![1]);
        f.orchestrator
            .delete_firmware("firmware_monitor_ecu_v1.bin")
            .await
            .unwrap();
        assert!(f.storage.file("firmware_monitor_ecu_v1.bin").is_none());
    }
}
