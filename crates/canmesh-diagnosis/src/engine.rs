//! Periodic aggregation of transport counters into the diagnosis history.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use canmesh_can::CanTransport;

use crate::error::DiagnosisResult;
use crate::sample::{DiagnosisSample, HistoryRing, DIAG_HISTORY_SIZE};

/// Thresholds evaluated against every sample.
///
/// A value equal to its threshold is not a breach; only strictly greater
/// trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisThresholds {
    /// Driver TX error counter threshold.
    pub tx_errors: u32,
    /// Driver RX error counter threshold.
    pub rx_errors: u32,
    /// Bus load percentage threshold.
    pub bus_load_percent: u32,
    /// Maximum transmit latency threshold, microseconds.
    pub max_latency_us: i64,
    /// Retransmission total threshold.
    pub retransmissions: u32,
    /// Collision proxy total threshold.
    pub collisions: u32,
}

impl Default for DiagnosisThresholds {
    fn default() -> Self {
        Self {
            tx_errors: 10,
            rx_errors: 10,
            bus_load_percent: 80,
            max_latency_us: 5_000,
            retransmissions: 5,
            collisions: 5,
        }
    }
}

/// Callback receiving abnormal samples.
pub type SampleCallback = Arc<dyn Fn(&DiagnosisSample) + Send + Sync>;

/// Periodic aggregator over the CAN transport.
pub struct DiagnosisEngine {
    transport: Arc<CanTransport>,
    history: Mutex<HistoryRing>,
    thresholds: RwLock<DiagnosisThresholds>,
    callbacks: RwLock<Vec<SampleCallback>>,
}

impl DiagnosisEngine {
    /// Create an engine reading from the given transport.
    pub fn new(transport: Arc<CanTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            history: Mutex::new(HistoryRing::new()),
            thresholds: RwLock::new(DiagnosisThresholds::default()),
            callbacks: RwLock::new(Vec::new()),
        })
    }

    /// Take one sample: read every transport metric, evaluate thresholds,
    /// notify subscribers, then append to the history.
    ///
    /// # Errors
    ///
    /// Fails without recording anything when a transport read fails.
    pub async fn update(&self) -> DiagnosisResult<DiagnosisSample> {
        let can = self.transport.diagnostics().await?;
        let mut sample = DiagnosisSample {
            can,
            latency: self.transport.latency_metrics(),
            queue: self.transport.queue_status(),
            bus_load: self.transport.bus_load(),
            retransmission_count: self.transport.retransmission_count(),
            collision_count: self.transport.collision_count(),
            transmission_attempts: self.transport.transmission_attempts(),
            // A zero timestamp marks an empty history slot.
            timestamp_us: self.transport.micros_since_start().max(1),
            abnormal: false,
        };

        self.analyze(&mut sample);
        self.history.lock().push(sample);
        Ok(sample)
    }

    /// Log a formatted sample.
    pub fn print(&self, sample: &DiagnosisSample) {
        info!(
            tx_errors = sample.can.tx_error_counter,
            rx_errors = sample.can.rx_error_counter,
            bus_off = sample.can.bus_off,
            bus_load = sample.bus_load,
            latency_samples = sample.latency.num_samples,
            max_latency_us = sample.latency.max_latency_us,
            queue_waiting = sample.queue.messages_waiting,
            retransmissions = sample.retransmission_count,
            collisions = sample.collision_count,
            attempts = sample.transmission_attempts,
            timestamp_us = sample.timestamp_us,
            abnormal = sample.abnormal,
            "diagnosis sample"
        );
    }

    /// Copy out up to `max` history slots, oldest slot first.
    ///
    /// Slots never written carry a zero timestamp.
    pub fn history(&self, max: usize) -> Vec<DiagnosisSample> {
        let history = self.history.lock();
        history
            .samples
            .iter()
            .take(max.min(DIAG_HISTORY_SIZE))
            .copied()
            .collect()
    }

    /// Replace the evaluation thresholds.
    pub fn set_thresholds(&self, thresholds: DiagnosisThresholds) {
        *self.thresholds.write() = thresholds;
        info!("diagnosis thresholds updated");
    }

    /// Current evaluation thresholds.
    pub fn thresholds(&self) -> DiagnosisThresholds {
        *self.thresholds.read()
    }

    /// Register a callback for abnormal samples.
    pub fn register_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&DiagnosisSample) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Mean and population standard deviation of the retained
    /// `max_latency` values, in microseconds.
    ///
    /// Only slots with a nonzero timestamp count. With no valid slots both
    /// values are zero.
    pub fn latency_statistics(&self) -> (i64, i64) {
        let history = self.history.lock();
        let mut valid = 0u32;
        let mut sum = 0i64;
        let mut sum_sq = 0i64;
        for sample in &history.samples {
            if sample.timestamp_us != 0 {
                let latency = sample.latency.max_latency_us;
                sum += latency;
                sum_sq += latency * latency;
                valid += 1;
            }
        }
        if valid == 0 {
            warn!("no valid samples for latency statistics");
            return (0, 0);
        }
        let mean = sum / i64::from(valid);
        let variance = (sum_sq as f64 / f64::from(valid)) - (mean as f64 * mean as f64);
        (mean, variance.max(0.0).sqrt() as i64)
    }

    fn analyze(&self, sample: &mut DiagnosisSample) {
        let thresholds = *self.thresholds.read();
        sample.abnormal = false;

        if sample.can.bus_off {
            warn!("controller reports bus-off");
            sample.abnormal = true;
        }
        if sample.can.tx_error_counter > thresholds.tx_errors {
            warn!(
                tx_errors = sample.can.tx_error_counter,
                "TX error counter over threshold"
            );
            sample.abnormal = true;
        }
        if sample.can.rx_error_counter > thresholds.rx_errors {
            warn!(
                rx_errors = sample.can.rx_error_counter,
                "RX error counter over threshold"
            );
            sample.abnormal = true;
        }
        if sample.bus_load > thresholds.bus_load_percent {
            warn!(bus_load = sample.bus_load, "bus load over threshold");
            sample.abnormal = true;
        }
        if sample.latency.max_latency_us > thresholds.max_latency_us {
            warn!(
                max_latency_us = sample.latency.max_latency_us,
                "transmit latency over threshold"
            );
            sample.abnormal = true;
        }
        if sample.retransmission_count > thresholds.retransmissions {
            warn!(
                retransmissions = sample.retransmission_count,
                "retransmissions over threshold"
            );
            sample.abnormal = true;
        }
        if sample.collision_count > thresholds.collisions {
            warn!(
                collisions = sample.collision_count,
                "collision proxy over threshold"
            );
            sample.abnormal = true;
        }

        if sample.abnormal {
            let callbacks = self.callbacks.read().clone();
            for callback in &callbacks {
                callback(sample);
            }
        }
    }
}

impl std::fmt::Debug for DiagnosisEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosisEngine")
            .field("thresholds", &*self.thresholds.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canmesh_can::testing::MockDriver;
    use canmesh_can::{BusState, CanConfig, DriverStatus, LatencyMetrics};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn engine_with_driver() -> (Arc<DiagnosisEngine>, Arc<MockDriver>) {
        let driver = Arc::new(MockDriver::new());
        let transport = CanTransport::init(driver.clone(), CanConfig::default())
            .await
            .unwrap();
        (DiagnosisEngine::new(transport), driver)
    }

    #[tokio::test]
    async fn healthy_bus_yields_normal_sample() {
        let (engine, _driver) = engine_with_driver().await;
        let sample = engine.update().await.unwrap();
        assert!(!sample.abnormal);
        assert_ne!(sample.timestamp_us, 0);
    }

    #[tokio::test]
    async fn error_counter_breach_marks_abnormal_and_notifies() {
        let (engine, driver) = engine_with_driver().await;
        driver.set_status(DriverStatus {
            tx_error_counter: 50,
            rx_error_counter: 0,
            state: BusState::Running,
        });

        let notified = Arc::new(AtomicU32::new(0));
        let seen = notified.clone();
        engine.register_alert_callback(move |sample| {
            assert!(sample.abnormal);
            seen.fetch_add(1, Ordering::Relaxed);
        });

        let sample = engine.update().await.unwrap();
        assert!(sample.abnormal);
        assert_eq!(notified.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn bus_off_alone_is_abnormal() {
        let (engine, driver) = engine_with_driver().await;
        driver.set_status(DriverStatus {
            tx_error_counter: 0,
            rx_error_counter: 0,
            state: BusState::BusOff,
        });
        let sample = engine.update().await.unwrap();
        assert!(sample.can.bus_off);
        assert!(sample.abnormal);
    }

    #[tokio::test]
    async fn exactly_k_slots_are_valid_after_k_updates() {
        let (engine, _driver) = engine_with_driver().await;
        for _ in 0..7 {
            engine.update().await.unwrap();
        }
        let valid = engine
            .history(DIAG_HISTORY_SIZE)
            .iter()
            .filter(|s| s.timestamp_us != 0)
            .count();
        assert_eq!(valid, 7);
    }

    #[tokio::test]
    async fn latency_equal_to_threshold_is_not_abnormal() {
        let (engine, _driver) = engine_with_driver().await;
        let thresholds = engine.thresholds();

        let mut at_threshold = DiagnosisSample {
            latency: LatencyMetrics {
                num_samples: 1,
                total_latency_us: thresholds.max_latency_us,
                min_latency_us: thresholds.max_latency_us,
                max_latency_us: thresholds.max_latency_us,
            },
            timestamp_us: 1,
            ..DiagnosisSample::default()
        };
        engine.analyze(&mut at_threshold);
        assert!(!at_threshold.abnormal);

        let mut over_threshold = at_threshold;
        over_threshold.latency.max_latency_us += 1;
        engine.analyze(&mut over_threshold);
        assert!(over_threshold.abnormal);
    }

    #[tokio::test]
    async fn statistics_over_identical_samples_have_zero_stddev() {
        let (engine, _driver) = engine_with_driver().await;
        for _ in 0..3 {
            let sample = DiagnosisSample {
                latency: LatencyMetrics {
                    num_samples: 1,
                    total_latency_us: 400,
                    min_latency_us: 400,
                    max_latency_us: 400,
                },
                timestamp_us: 1,
                ..DiagnosisSample::default()
            };
            engine.history.lock().push(sample);
        }
        let (mean, stddev) = engine.latency_statistics();
        assert_eq!(mean, 400);
        assert_eq!(stddev, 0);
    }

    #[tokio::test]
    async fn statistics_without_samples_are_zero_and_succeed() {
        let (engine, _driver) = engine_with_driver().await;
        assert_eq!(engine.latency_statistics(), (0, 0));
    }

    #[tokio::test]
    async fn history_is_capped_at_requested_size() {
        let (engine, _driver) = engine_with_driver().await;
        for _ in 0..5 {
            engine.update().await.unwrap();
        }
        assert_eq!(engine.history(3).len(), 3);
        assert_eq!(engine.history(500).len(), DIAG_HISTORY_SIZE);
    }
}
