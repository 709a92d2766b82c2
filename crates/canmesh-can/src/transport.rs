//! The CAN transport: queueing, retransmission, metrics and self-test.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::{BusState, CanConfig, CanDriver, CanFilter, WireFrame};
use crate::error::{CanError, CanResult};
use crate::frame::{xor_checksum, CanFrame, MAX_DATA_LENGTH};
use crate::metrics::{DriverDiagnostics, LatencyMetrics, QueueStatus};
use crate::queue::TxQueue;
use crate::{MAX_RETRIES, RETRY_BACKOFF_MS, SELF_TEST_ID, TX_QUEUE_CAPACITY};

/// Callback invoked after each transmission attempt resolves.
pub type TxCallback = Arc<dyn Fn(u32, &[u8], CanResult<()>) + Send + Sync>;

/// Callback invoked for every frame taken off the bus by the RX worker.
pub type RxCallback = Arc<dyn Fn(&CanFrame) + Send + Sync>;

/// Recorded scheduling priority of the TX worker.
///
/// The worker raises itself when the queue saturates and restores the
/// baseline once it drains below the threshold; the level is observable so
/// supervisors and tests can verify the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxTaskPriority {
    /// Normal operation.
    Baseline,
    /// Queue depth reached 80 % of capacity.
    Elevated,
}

impl TxTaskPriority {
    /// Numeric priority level, matching the firmware task table.
    pub fn level(&self) -> u8 {
        match self {
            TxTaskPriority::Baseline => 10,
            TxTaskPriority::Elevated => 15,
        }
    }
}

/// Priority-aware, retransmitting CAN wire interface.
pub struct CanTransport {
    driver: Arc<dyn CanDriver>,
    config: RwLock<CanConfig>,
    latency: Mutex<LatencyMetrics>,
    tx_queue: TxQueue,
    retransmissions: AtomicU32,
    collisions: AtomicU32,
    attempts: AtomicU32,
    bus_busy_us: AtomicU64,
    started_at: Instant,
    tx_callbacks: RwLock<Vec<TxCallback>>,
    rx_callbacks: RwLock<Vec<RxCallback>>,
    tx_priority: AtomicU8,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CanTransport {
    /// Install and start the driver, returning the ready transport.
    ///
    /// # Errors
    ///
    /// Driver install/start failures are fatal and surfaced unchanged.
    pub async fn init(driver: Arc<dyn CanDriver>, config: CanConfig) -> CanResult<Arc<Self>> {
        driver.install(&config).await?;
        driver.start().await?;
        info!(bitrate = config.bitrate, "CAN bus started");

        Ok(Arc::new(Self {
            driver,
            config: RwLock::new(config),
            latency: Mutex::new(LatencyMetrics::default()),
            tx_queue: TxQueue::new(TX_QUEUE_CAPACITY),
            retransmissions: AtomicU32::new(0),
            collisions: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            bus_busy_us: AtomicU64::new(0),
            started_at: Instant::now(),
            tx_callbacks: RwLock::new(Vec::new()),
            rx_callbacks: RwLock::new(Vec::new()),
            tx_priority: AtomicU8::new(TxTaskPriority::Baseline.level()),
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Drain and reinstall the driver under a new configuration.
    pub async fn reconfigure(&self, config: CanConfig) -> CanResult<()> {
        self.driver.stop().await?;
        self.driver.uninstall().await?;
        *self.config.write() = config.clone();
        self.driver.install(&config).await?;
        self.driver.start().await?;
        info!(bitrate = config.bitrate, "CAN bus reconfigured");
        Ok(())
    }

    /// Stop the workers and tear the driver down.
    pub async fn shutdown(&self) -> CanResult<()> {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
        self.driver.stop().await?;
        self.driver.uninstall().await?;
        info!("CAN bus shut down");
        Ok(())
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> CanConfig {
        self.config.read().clone()
    }

    /// Update the driver timeouts without reinstalling.
    pub fn set_timeouts(&self, tx_timeout_ms: u32, rx_timeout_ms: u32) {
        let mut config = self.config.write();
        config.transmit_timeout_ms = tx_timeout_ms;
        config.receive_timeout_ms = rx_timeout_ms;
        info!(tx_timeout_ms, rx_timeout_ms, "CAN timeouts updated");
    }

    /// Swap the acceptance filter; reinstalls the driver.
    pub async fn set_filter(&self, filter: CanFilter) -> CanResult<()> {
        let config = {
            let mut config = self.config.write();
            config.filter = filter;
            config.clone()
        };
        self.reconfigure(config).await
    }

    /// Transmit one frame synchronously, bypassing the TX queue.
    pub async fn send_sync(&self, id: u32, payload: &[u8]) -> CanResult<()> {
        let config = self.config();
        let wire = Self::to_wire(id, payload, &config)?;
        match self.driver.transmit(&wire, config.transmit_timeout()).await {
            Ok(()) => {
                self.notify_tx(id, payload, Ok(()));
                Ok(())
            }
            Err(err) => {
                error!(id = format_args!("0x{id:08X}"), %err, "synchronous transmit failed");
                self.notify_tx(id, payload, Err(CanError::Transmit(id)));
                Err(CanError::Transmit(id))
            }
        }
    }

    /// Receive one frame, verifying the checksum in checksum mode.
    ///
    /// The reported length excludes the checksum byte. Timeouts surface as
    /// [`CanError::Timeout`] and are non-fatal.
    pub async fn receive_sync(&self, timeout: Duration) -> CanResult<CanFrame> {
        let use_checksum = self.config.read().use_checksum;
        let wire = self.driver.receive(timeout).await?;
        let mut frame = CanFrame {
            id: wire.id,
            data: wire.data,
            dlc: wire.dlc.min(MAX_DATA_LENGTH as u8),
            retry_count: 0,
        };
        if use_checksum {
            if frame.dlc < 1 {
                return Err(CanError::receive("frame carries no checksum byte"));
            }
            let body = frame.dlc as usize - 1;
            if xor_checksum(&frame.data[..body]) != frame.data[body] {
                return Err(CanError::receive(format!(
                    "checksum mismatch on frame 0x{:08X}",
                    frame.id
                )));
            }
            frame.dlc -= 1;
        }
        Ok(frame)
    }

    /// Queue a frame for the TX worker.
    ///
    /// `high_priority` prepends the frame. Waits while the queue is full.
    pub async fn enqueue(&self, mut frame: CanFrame, high_priority: bool) -> CanResult<()> {
        frame.retry_count = 0;
        self.tx_queue.push(frame, high_priority).await
    }

    /// Register a callback for frames delivered by the RX worker.
    pub fn register_rx_callback<F>(&self, callback: F)
    where
        F: Fn(&CanFrame) + Send + Sync + 'static,
    {
        self.rx_callbacks.write().push(Arc::new(callback));
    }

    /// Register a callback for transmission outcomes.
    pub fn register_tx_callback<F>(&self, callback: F)
    where
        F: Fn(u32, &[u8], CanResult<()>) + Send + Sync + 'static,
    {
        self.tx_callbacks.write().push(Arc::new(callback));
    }

    /// Spawn the TX worker draining the queue.
    pub fn start_transmit_task(self: &Arc<Self>) {
        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let frame = transport.tx_queue.pop().await;
                transport.transmit_once(frame).await;
                transport.adjust_tx_priority();
            }
        });
        self.workers.lock().push(handle);
    }

    /// Spawn the RX worker feeding registered callbacks.
    pub fn start_receive_task(self: &Arc<Self>) {
        let transport = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match transport.receive_sync(Duration::from_millis(500)).await {
                    Ok(frame) => {
                        debug!(
                            id = format_args!("0x{:08X}", frame.id),
                            dlc = frame.dlc,
                            "frame received"
                        );
                        let callbacks = transport.rx_callbacks.read().clone();
                        for callback in &callbacks {
                            callback(&frame);
                        }
                    }
                    Err(CanError::Timeout) => {}
                    Err(err) => warn!(%err, "RX worker receive failed"),
                }
            }
        });
        self.workers.lock().push(handle);
    }

    async fn transmit_once(&self, mut frame: CanFrame) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        let (wire, timeout) = {
            let config = self.config.read();
            (
                Self::to_wire(frame.id, frame.payload(), &config),
                config.transmit_timeout(),
            )
        };
        let wire = match wire {
            Ok(wire) => wire,
            Err(err) => {
                error!(id = format_args!("0x{:08X}", frame.id), %err, "unsendable frame dropped");
                self.notify_tx(frame.id, frame.payload(), Err(err));
                return;
            }
        };

        let t0 = Instant::now();
        match self.driver.transmit(&wire, timeout).await {
            Ok(()) => {
                let latency_us = t0.elapsed().as_micros() as i64;
                self.latency.lock().record(latency_us);
                self.bus_busy_us
                    .fetch_add(latency_us as u64, Ordering::Relaxed);
                debug!(
                    id = format_args!("0x{:08X}", frame.id),
                    latency_us, "frame transmitted"
                );
                self.notify_tx(frame.id, frame.payload(), Ok(()));
            }
            Err(_) if frame.retry_count < MAX_RETRIES => {
                frame.retry_count += 1;
                self.retransmissions.fetch_add(1, Ordering::Relaxed);
                // TODO: stop conflating the collision proxy with plain
                // retransmissions once the driver exposes arbitration-loss
                // counters.
                self.collisions.fetch_add(1, Ordering::Relaxed);
                warn!(
                    id = format_args!("0x{:08X}", frame.id),
                    retry = frame.retry_count,
                    "transmit failed, backing off"
                );
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
                self.tx_queue.requeue_front(frame);
            }
            Err(err) => {
                error!(
                    id = format_args!("0x{:08X}", frame.id),
                    %err,
                    "frame dropped after {MAX_RETRIES} retransmissions"
                );
                self.notify_tx(frame.id, frame.payload(), Err(CanError::Transmit(frame.id)));
            }
        }
    }

    fn adjust_tx_priority(&self) {
        let depth = self.tx_queue.len();
        let threshold = TX_QUEUE_CAPACITY * 80 / 100;
        let current = self.tx_priority.load(Ordering::Relaxed);
        if depth >= threshold && current < TxTaskPriority::Elevated.level() {
            info!(depth, "TX queue saturated, raising worker priority");
            self.tx_priority
                .store(TxTaskPriority::Elevated.level(), Ordering::Relaxed);
        } else if depth < threshold && current > TxTaskPriority::Baseline.level() {
            info!(depth, "TX queue drained, restoring worker priority");
            self.tx_priority
                .store(TxTaskPriority::Baseline.level(), Ordering::Relaxed);
        }
    }

    /// Current recorded TX worker priority.
    pub fn tx_task_priority(&self) -> TxTaskPriority {
        if self.tx_priority.load(Ordering::Relaxed) >= TxTaskPriority::Elevated.level() {
            TxTaskPriority::Elevated
        } else {
            TxTaskPriority::Baseline
        }
    }

    /// Snapshot of the driver's error counters and bus-off state.
    pub async fn diagnostics(&self) -> CanResult<DriverDiagnostics> {
        let status = self.driver.status_info().await?;
        Ok(DriverDiagnostics {
            tx_error_counter: status.tx_error_counter,
            rx_error_counter: status.rx_error_counter,
            bus_off: status.state == BusState::BusOff,
        })
    }

    /// Snapshot of the transmit latency metrics.
    pub fn latency_metrics(&self) -> LatencyMetrics {
        *self.latency.lock()
    }

    /// Snapshot of the TX queue occupancy.
    pub fn queue_status(&self) -> QueueStatus {
        self.tx_queue.status()
    }

    /// Bus load percentage: transmit-busy time over elapsed wall time.
    pub fn bus_load(&self) -> u32 {
        let elapsed_us = self.started_at.elapsed().as_micros() as u64;
        if elapsed_us == 0 {
            return 0;
        }
        let busy_us = self.bus_busy_us.load(Ordering::Relaxed);
        (busy_us.saturating_mul(100) / elapsed_us) as u32
    }

    /// Total retransmissions performed by the TX worker.
    pub fn retransmission_count(&self) -> u32 {
        self.retransmissions.load(Ordering::Relaxed)
    }

    /// Collision proxy total (currently tracks retransmissions).
    pub fn collision_count(&self) -> u32 {
        self.collisions.load(Ordering::Relaxed)
    }

    /// Collision rate percentage over all transmission attempts.
    pub fn collision_rate(&self) -> u32 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0;
        }
        let collisions = u64::from(self.collisions.load(Ordering::Relaxed));
        (collisions * 100 / u64::from(attempts)) as u32
    }

    /// Total transmission attempts, retries included.
    pub fn transmission_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Loopback self-test: measure the round-trip time in microseconds.
    ///
    /// Temporarily enables self-reception, transmits the current timestamp
    /// on [`SELF_TEST_ID`] and waits for it to come back. The previous
    /// self-reception setting is restored on every path.
    pub async fn measure_round_trip(&self, timeout: Duration) -> CanResult<i64> {
        let original_self_rx = {
            let mut config = self.config.write();
            let original = config.self_rx;
            config.self_rx = true;
            original
        };

        let sent_us = self.micros_since_start();
        let result = self.round_trip_inner(sent_us, timeout).await;

        self.config.write().self_rx = original_self_rx;

        result?;
        let round_trip = (self.micros_since_start() - sent_us) as i64;
        debug!(round_trip_us = round_trip, "loopback self-test complete");
        Ok(round_trip)
    }

    async fn round_trip_inner(&self, sent_us: u64, timeout: Duration) -> CanResult<()> {
        let payload = (sent_us as i64).to_le_bytes();
        self.send_sync(SELF_TEST_ID, &payload).await?;
        let frame = self.receive_sync(timeout).await?;
        if (frame.dlc as usize) < payload.len() {
            return Err(CanError::receive("self-test frame too short"));
        }
        Ok(())
    }

    /// Microseconds elapsed since the transport started.
    pub fn micros_since_start(&self) -> u64 {
        self.started_at.elapsed().as_micros() as u64
    }

    fn notify_tx(&self, id: u32, payload: &[u8], status: CanResult<()>) {
        let callbacks = self.tx_callbacks.read().clone();
        for callback in &callbacks {
            callback(id, payload, status.clone());
        }
    }

    fn to_wire(id: u32, payload: &[u8], config: &CanConfig) -> CanResult<WireFrame> {
        if payload.len() > MAX_DATA_LENGTH {
            return Err(CanError::InvalidLength(payload.len()));
        }
        let mut data = [0u8; MAX_DATA_LENGTH];
        data[..payload.len()].copy_from_slice(payload);
        let mut dlc = payload.len();
        if config.use_checksum {
            if payload.len() >= MAX_DATA_LENGTH {
                return Err(CanError::InvalidLength(payload.len()));
            }
            data[dlc] = xor_checksum(payload);
            dlc += 1;
        }
        Ok(WireFrame {
            id,
            data,
            dlc: dlc as u8,
            extended: true,
            rtr: false,
            single_shot: false,
            self_rx: config.self_rx,
        })
    }
}

impl std::fmt::Debug for CanTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanTransport")
            .field("config", &*self.config.read())
            .field("queue", &self.tx_queue.status())
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;

    async fn transport_with(driver: Arc<MockDriver>, config: CanConfig) -> Arc<CanTransport> {
        CanTransport::init(driver, config).await.unwrap()
    }

    #[tokio::test]
    async fn init_installs_and_starts_driver() {
        let driver = Arc::new(MockDriver::new());
        let _transport = transport_with(driver.clone(), CanConfig::default()).await;
        assert!(driver.is_installed());
        assert!(driver.is_started());
    }

    #[tokio::test]
    async fn install_failure_surfaces_as_driver_install() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_install(CanError::DriverInstall("no controller".into()));
        let result = CanTransport::init(driver, CanConfig::default()).await;
        assert!(matches!(result, Err(CanError::DriverInstall(_))));
    }

    #[tokio::test]
    async fn send_sync_appends_checksum() {
        let driver = Arc::new(MockDriver::new());
        let config = CanConfig {
            use_checksum: true,
            ..CanConfig::default()
        };
        let transport = transport_with(driver.clone(), config).await;

        transport.send_sync(0x100, &[0x12, 0x34]).await.unwrap();
        let sent = driver.transmitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dlc, 3);
        assert_eq!(sent[0].data[2], 0x12 ^ 0x34);
    }

    #[tokio::test]
    async fn full_payload_with_checksum_is_rejected() {
        let driver = Arc::new(MockDriver::new());
        let config = CanConfig {
            use_checksum: true,
            ..CanConfig::default()
        };
        let transport = transport_with(driver, config).await;

        let err = transport.send_sync(0x100, &[0u8; 8]).await.unwrap_err();
        assert_eq!(err, CanError::InvalidLength(8));
    }

    #[tokio::test]
    async fn checksum_round_trip_and_mutation_detection() {
        let driver = Arc::new(MockDriver::new());
        let config = CanConfig {
            use_checksum: true,
            self_rx: true,
            ..CanConfig::default()
        };
        let transport = transport_with(driver.clone(), config).await;

        let payload = [1u8, 2, 3, 4, 5];
        transport.send_sync(0x200, &payload).await.unwrap();
        let frame = transport
            .receive_sync(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(frame.payload(), &payload);

        // Corrupt one byte and feed the frame back in.
        let mut corrupted = driver.transmitted()[0];
        corrupted.data[1] ^= 0xFF;
        driver.push_rx(corrupted);
        let err = transport
            .receive_sync(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CanError::Receive(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_succeed_updates_counters_once() {
        let driver = Arc::new(MockDriver::new());
        driver.script_transmits([Err(CanError::Transmit(0)), Err(CanError::Transmit(0)), Ok(())]);
        let transport = transport_with(driver.clone(), CanConfig::default()).await;
        transport.start_transmit_task();

        let frame = CanFrame::new(crate::encode_id(1, 2, 0x300), &[9]).unwrap();
        transport.enqueue(frame, false).await.unwrap();

        // Two 50 ms backoffs plus slack for the worker to finish.
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(transport.retransmission_count(), 2);
        assert_eq!(transport.collision_count(), 2);
        assert_eq!(transport.transmission_attempts(), 3);
        assert_eq!(transport.latency_metrics().num_samples, 1);
        assert_eq!(driver.transmitted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn frame_is_dropped_after_max_retries() {
        let driver = Arc::new(MockDriver::new());
        driver.script_transmits(std::iter::repeat(Err(CanError::Transmit(0))).take(10));
        let transport = transport_with(driver.clone(), CanConfig::default()).await;

        let failures = Arc::new(AtomicU32::new(0));
        let seen = failures.clone();
        transport.register_tx_callback(move |_, _, status| {
            if status.is_err() {
                seen.fetch_add(1, Ordering::Relaxed);
            }
        });
        transport.start_transmit_task();

        let frame = CanFrame::new(0x123, &[]).unwrap();
        transport.enqueue(frame, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(failures.load(Ordering::Relaxed), 1);
        assert_eq!(transport.transmission_attempts(), u32::from(MAX_RETRIES) + 1);
        assert_eq!(driver.transmitted().len(), 0);
    }

    #[tokio::test]
    async fn tx_priority_raises_at_80_percent_and_restores_below() {
        let driver = Arc::new(MockDriver::new());
        let transport = transport_with(driver, CanConfig::default()).await;
        let threshold = TX_QUEUE_CAPACITY * 80 / 100;

        for i in 0..threshold {
            let frame = CanFrame::new(i as u32, &[]).unwrap();
            transport.tx_queue.try_push(frame, false).unwrap();
        }
        transport.adjust_tx_priority();
        assert_eq!(transport.tx_task_priority(), TxTaskPriority::Elevated);
        assert_eq!(transport.tx_task_priority().level(), 15);

        transport.tx_queue.try_pop().unwrap();
        transport.adjust_tx_priority();
        assert_eq!(transport.tx_task_priority(), TxTaskPriority::Baseline);
        assert_eq!(transport.tx_task_priority().level(), 10);
    }

    #[tokio::test]
    async fn loopback_round_trip_restores_self_rx() {
        let driver = Arc::new(MockDriver::new());
        let transport = transport_with(driver, CanConfig::default()).await;

        let round_trip = transport
            .measure_round_trip(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(round_trip >= 0);
        assert!(!transport.config().self_rx);
    }

    #[tokio::test]
    async fn loopback_timeout_still_restores_self_rx() {
        let driver = Arc::new(MockDriver::new());
        // Swallow the self-test frame so nothing loops back.
        driver.script_transmits([Err(CanError::Transmit(SELF_TEST_ID))]);
        let transport = transport_with(driver, CanConfig::default()).await;

        let err = transport
            .measure_round_trip(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CanError::Transmit(_)));
        assert!(!transport.config().self_rx);
    }

    #[tokio::test]
    async fn rx_worker_feeds_callbacks() {
        let driver = Arc::new(MockDriver::new());
        let transport = transport_with(driver.clone(), CanConfig::default()).await;

        let received = Arc::new(AtomicU32::new(0));
        let seen = received.clone();
        transport.register_rx_callback(move |frame| {
            assert_eq!(frame.id, 0x0401_0101);
            seen.fetch_add(1, Ordering::Relaxed);
        });
        transport.start_receive_task();

        driver.push_rx(WireFrame {
            id: 0x0401_0101,
            data: [7; 8],
            dlc: 8,
            extended: true,
            rtr: false,
            single_shot: false,
            self_rx: false,
        });

        tokio::time::timeout(Duration::from_secs(1), async {
            while received.load(Ordering::Relaxed) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        transport.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn bus_load_is_zero_without_traffic() {
        let driver = Arc::new(MockDriver::new());
        let transport = transport_with(driver, CanConfig::default()).await;
        assert_eq!(transport.bus_load(), 0);
        assert_eq!(transport.collision_rate(), 0);
    }
}
