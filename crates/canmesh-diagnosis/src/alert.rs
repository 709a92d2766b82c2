//! Threshold-driven alert sink feeding the persistent logger.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use canmesh_logger::{LogLevel, Logger, MESSAGE_MAX_BYTES};
use canmesh_storage::Rtc;

use crate::sample::DiagnosisSample;

/// Capacity of the alert history ring.
pub const ALERT_HISTORY_SIZE: usize = 100;

/// Alert message for a detected bus-off state.
pub const MSG_BUS_OFF: &str = "Estado Bus-Off detectado!";
/// Alert message for elevated TX/RX error counters.
pub const MSG_ERROR_RATE: &str = "Alta taxa de erros na rede CAN!";
/// Alert message for bus load over threshold.
pub const MSG_BUS_LOAD: &str = "Carga do barramento CAN acima do limiar!";
/// Alert message for retransmissions over threshold.
pub const MSG_RETRANSMISSIONS: &str = "Alta taxa de retransmissões na rede CAN!";

/// One ring-buffered alert.
///
/// A zero timestamp marks an empty slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEntry {
    /// Milliseconds since the Unix epoch, from the RTC.
    pub timestamp_ms: u64,
    /// Severity.
    pub level: LogLevel,
    /// Message, at most 128 bytes.
    pub message: String,
}

/// Alert rule thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Driver TX error counter threshold.
    pub tx_error_threshold: u32,
    /// Driver RX error counter threshold.
    pub rx_error_threshold: u32,
    /// Bus load percentage threshold.
    pub bus_load_threshold: u32,
    /// Retransmission total threshold.
    pub retransmission_threshold: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            tx_error_threshold: 100,
            rx_error_threshold: 100,
            bus_load_threshold: 80,
            retransmission_threshold: 50,
        }
    }
}

/// Callback receiving alerts as they are raised.
pub type AlertCallback = Arc<dyn Fn(&AlertEntry) + Send + Sync>;

struct AlertRing {
    entries: Vec<AlertEntry>,
    index: usize,
}

impl AlertRing {
    fn new() -> Self {
        Self {
            entries: vec![AlertEntry::default(); ALERT_HISTORY_SIZE],
            index: 0,
        }
    }

    fn push(&mut self, entry: AlertEntry) {
        self.entries[self.index] = entry;
        self.index = (self.index + 1) % ALERT_HISTORY_SIZE;
    }
}

/// Ring-buffered alert log with threshold rules.
pub struct AlertSink {
    ring: Mutex<AlertRing>,
    thresholds: RwLock<AlertThresholds>,
    callbacks: RwLock<Vec<AlertCallback>>,
    rtc: Arc<dyn Rtc>,
    logger: Arc<Logger>,
}

impl AlertSink {
    /// Create a sink timestamping through `rtc` and mirroring into `logger`.
    pub fn new(rtc: Arc<dyn Rtc>, logger: Arc<Logger>) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(AlertRing::new()),
            thresholds: RwLock::new(AlertThresholds::default()),
            callbacks: RwLock::new(Vec::new()),
            rtc,
            logger,
        })
    }

    /// Evaluate a sample against the alert rules.
    ///
    /// At most one alert per triggered rule, in order: bus-off (critical),
    /// TX or RX error counter (warning), bus load (warning),
    /// retransmissions (warning).
    pub fn check_conditions(&self, sample: &DiagnosisSample) {
        let thresholds = *self.thresholds.read();

        if sample.can.bus_off {
            self.raise(LogLevel::Critical, MSG_BUS_OFF);
        }
        if sample.can.tx_error_counter > thresholds.tx_error_threshold
            || sample.can.rx_error_counter > thresholds.rx_error_threshold
        {
            self.raise(LogLevel::Warning, MSG_ERROR_RATE);
        }
        if sample.bus_load > thresholds.bus_load_threshold {
            self.raise(LogLevel::Warning, MSG_BUS_LOAD);
        }
        if sample.retransmission_count > thresholds.retransmission_threshold {
            self.raise(LogLevel::Warning, MSG_RETRANSMISSIONS);
        }
    }

    /// Copy out up to `max` retained alerts, oldest slot first.
    pub fn history(&self, max: usize) -> Vec<AlertEntry> {
        let ring = self.ring.lock();
        ring.entries
            .iter()
            .filter(|entry| entry.timestamp_ms != 0)
            .take(max)
            .cloned()
            .collect()
    }

    /// Log every retained alert through `tracing`.
    pub fn print_history(&self) {
        for entry in self.history(ALERT_HISTORY_SIZE) {
            info!(
                timestamp_ms = entry.timestamp_ms,
                level = %entry.level,
                message = %entry.message,
                "alert history entry"
            );
        }
    }

    /// Replace the alert thresholds.
    pub fn set_thresholds(&self, thresholds: AlertThresholds) {
        *self.thresholds.write() = thresholds;
        info!(
            tx = thresholds.tx_error_threshold,
            rx = thresholds.rx_error_threshold,
            bus_load = thresholds.bus_load_threshold,
            retransmissions = thresholds.retransmission_threshold,
            "alert thresholds updated"
        );
    }

    /// Current alert thresholds.
    pub fn thresholds(&self) -> AlertThresholds {
        *self.thresholds.read()
    }

    /// Register a callback for raised alerts.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&AlertEntry) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    fn raise(&self, level: LogLevel, message: &str) {
        let mut message = message.to_string();
        if message.len() > MESSAGE_MAX_BYTES {
            let mut cut = MESSAGE_MAX_BYTES;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        let entry = AlertEntry {
            timestamp_ms: self.rtc.now_ms(),
            level,
            message,
        };
        warn!(
            level = %entry.level,
            message = %entry.message,
            timestamp_ms = entry.timestamp_ms,
            "alert raised"
        );
        self.ring.lock().push(entry.clone());
        self.logger.log_alert(level, &entry.message);

        let callbacks = self.callbacks.read().clone();
        for callback in &callbacks {
            callback(&entry);
        }
    }
}

impl std::fmt::Debug for AlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSink")
            .field("thresholds", &*self.thresholds.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canmesh_can::DriverDiagnostics;
    use canmesh_logger::LoggerSettings;
    use canmesh_storage::testing::{ManualRtc, MemoryKvStore, MemorySdStorage};

    fn sink() -> (Arc<AlertSink>, Arc<Logger>) {
        let rtc = Arc::new(ManualRtc::starting_at(5_000));
        let logger = Logger::new(
            rtc.clone(),
            Arc::new(MemorySdStorage::new()),
            Arc::new(MemoryKvStore::new()),
            LoggerSettings::default(),
        );
        (AlertSink::new(rtc, logger.clone()), logger)
    }

    fn bus_off_sample() -> DiagnosisSample {
        DiagnosisSample {
            can: DriverDiagnostics {
                tx_error_counter: 0,
                rx_error_counter: 0,
                bus_off: true,
            },
            timestamp_us: 1,
            ..DiagnosisSample::default()
        }
    }

    #[tokio::test]
    async fn bus_off_raises_one_critical_alert_and_reaches_the_logger() {
        let (sink, logger) = sink();
        sink.check_conditions(&bus_off_sample());

        let history = sink.history(ALERT_HISTORY_SIZE);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].level, LogLevel::Critical);
        assert_eq!(history[0].message, MSG_BUS_OFF);
        assert_eq!(history[0].timestamp_ms, 5_000);

        let logged = logger.snapshot();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].message, format!("ALERTA: {MSG_BUS_OFF}"));
    }

    #[tokio::test]
    async fn tx_and_rx_breach_raise_a_single_warning() {
        let (sink, _logger) = sink();
        let sample = DiagnosisSample {
            can: DriverDiagnostics {
                tx_error_counter: 150,
                rx_error_counter: 150,
                bus_off: false,
            },
            timestamp_us: 1,
            ..DiagnosisSample::default()
        };
        sink.check_conditions(&sample);

        let history = sink.history(ALERT_HISTORY_SIZE);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].level, LogLevel::Warning);
        assert_eq!(history[0].message, MSG_ERROR_RATE);
    }

    #[tokio::test]
    async fn bus_load_over_threshold_warns_on_each_check() {
        let (sink, _logger) = sink();
        let sample = DiagnosisSample {
            bus_load: 81,
            timestamp_us: 1,
            ..DiagnosisSample::default()
        };
        for _ in 0..3 {
            sink.check_conditions(&sample);
        }

        let history = sink.history(ALERT_HISTORY_SIZE);
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|e| e.message == MSG_BUS_LOAD));
    }

    #[tokio::test]
    async fn quiet_sample_raises_nothing() {
        let (sink, logger) = sink();
        sink.check_conditions(&DiagnosisSample::default());
        assert!(sink.history(ALERT_HISTORY_SIZE).is_empty());
        assert!(logger.snapshot().is_empty());
    }

    #[tokio::test]
    async fn callbacks_observe_raised_alerts() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let (sink, _logger) = sink();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        sink.register_callback(move |entry| {
            assert_eq!(entry.message, MSG_BUS_OFF);
            counter.fetch_add(1, Ordering::Relaxed);
        });

        sink.check_conditions(&bus_off_sample());
        assert_eq!(seen.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn custom_thresholds_change_the_trip_point() {
        let (sink, _logger) = sink();
        sink.set_thresholds(AlertThresholds {
            retransmission_threshold: 2,
            ..AlertThresholds::default()
        });
        let sample = DiagnosisSample {
            retransmission_count: 3,
            timestamp_us: 1,
            ..DiagnosisSample::default()
        };
        sink.check_conditions(&sample);
        assert_eq!(sink.history(10)[0].message, MSG_RETRANSMISSIONS);
    }
}
