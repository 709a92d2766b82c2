//! The logger runtime: ring, alert channel and background duties.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use canmesh_storage::{KvStore, Rtc, SdStorage};

use crate::entry::{LogEntry, LogLevel, LogRing, MESSAGE_MAX_BYTES};
use crate::error::{LoggerError, LoggerResult};

/// Cadence of the critical-entry flush into the non-volatile store.
pub const FLUSH_PERIOD: Duration = Duration::from_secs(60);

/// Cadence of the free-space monitor.
pub const MONITOR_PERIOD: Duration = Duration::from_secs(30);

/// Local retries around each SD write before escalating.
const SD_RETRY_ATTEMPTS: u32 = 3;

/// Consecutive failed saves before the monitor resets its counter.
const SD_ERROR_THRESHOLD: u32 = 5;

/// Depth of the async-write queue.
const ASYNC_QUEUE_DEPTH: usize = 64;

const NVS_NAMESPACE: &str = "logger_storage";
const NVS_KEY: &str = "critical_logs";

/// Prefix stamped onto alert-channel messages.
const ALERT_PREFIX: &str = "ALERTA: ";

/// Callback receiving warning/critical entries as they are logged.
pub type AlertCallback = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Construction-time knobs of the logger.
#[derive(Debug, Clone)]
pub struct LoggerSettings {
    /// SD directory receiving rotated log files.
    pub directory: String,
    /// Minimum level retained in the ring.
    pub level: LogLevel,
    /// Rotation size for SD log files, in bytes.
    pub max_file_size: u64,
    /// Free-space floor below which the monitor raises a critical alert.
    pub free_space_threshold: u64,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            directory: "logs".to_string(),
            level: LogLevel::Info,
            max_file_size: 1024 * 1024,
            free_space_threshold: 512 * 1024,
        }
    }
}

/// Ring-buffered persistent logger.
pub struct Logger {
    ring: Mutex<LogRing>,
    level: RwLock<LogLevel>,
    directory: RwLock<String>,
    free_space_threshold: AtomicU64,
    alert_callbacks: RwLock<Vec<AlertCallback>>,
    rtc: Arc<dyn Rtc>,
    storage: Arc<dyn SdStorage>,
    kv: Arc<dyn KvStore>,
    async_tx: mpsc::Sender<String>,
    async_rx: Mutex<Option<mpsc::Receiver<String>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Logger {
    /// Create a logger over its collaborator seams.
    ///
    /// The RTC handle is owned for the logger's whole lifetime; timestamps
    /// never reopen the device.
    pub fn new(
        rtc: Arc<dyn Rtc>,
        storage: Arc<dyn SdStorage>,
        kv: Arc<dyn KvStore>,
        settings: LoggerSettings,
    ) -> Arc<Self> {
        let (async_tx, async_rx) = mpsc::channel(ASYNC_QUEUE_DEPTH);
        storage.set_rotation_size(settings.max_file_size);
        Arc::new(Self {
            ring: Mutex::new(LogRing::new()),
            level: RwLock::new(settings.level),
            directory: RwLock::new(settings.directory),
            free_space_threshold: AtomicU64::new(settings.free_space_threshold),
            alert_callbacks: RwLock::new(Vec::new()),
            rtc,
            storage,
            kv,
            async_tx,
            async_rx: Mutex::new(Some(async_rx)),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Record a message at the given level.
    ///
    /// Messages below the current minimum level are dropped before
    /// timestamping. Warning and critical entries are forwarded to the
    /// registered alert callbacks.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if level < *self.level.read() {
            return;
        }
        let entry = LogEntry {
            timestamp_ms: self.rtc.now_ms(),
            level,
            message: clamp_message(message.into()),
        };
        self.ring.lock().push(entry.clone());

        if level >= LogLevel::Warning {
            let callbacks = self.alert_callbacks.read().clone();
            for callback in &callbacks {
                callback(&entry);
            }
        }
    }

    /// Record an alert-channel message.
    pub fn log_alert(&self, level: LogLevel, message: &str) {
        self.log(level, format!("{ALERT_PREFIX}{message}"));
    }

    /// Register a callback for warning/critical entries.
    pub fn register_alert_callback<F>(&self, callback: F)
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        self.alert_callbacks.write().push(Arc::new(callback));
    }

    /// Log every buffered entry through `tracing`.
    pub fn print_buffer(&self) {
        for entry in self.snapshot() {
            info!(
                timestamp_ms = entry.timestamp_ms,
                level = %entry.level,
                message = %entry.message,
                "buffered log entry"
            );
        }
    }

    /// Valid buffered entries, oldest slot first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.ring.lock().valid_entries()
    }

    /// Change the minimum retained level.
    pub fn set_level(&self, level: LogLevel) {
        *self.level.write() = level;
        info!(level = %level, "minimum log level changed");
    }

    /// Change the SD directory receiving rotated log files.
    pub fn set_sd_directory(&self, directory: &str) {
        if directory.is_empty() {
            error!("empty log directory rejected");
            return;
        }
        *self.directory.write() = directory.to_string();
        info!(directory, "log directory changed");
    }

    /// Change the rotation size of SD log files.
    pub fn set_max_file_size(&self, bytes: u64) {
        self.storage.set_rotation_size(bytes);
        info!(bytes, "log rotation size changed");
    }

    /// Queue a line for the asynchronous SD writer.
    pub async fn async_write(&self, data: &str) -> LoggerResult<()> {
        self.async_tx
            .send(data.to_string())
            .await
            .map_err(|_| LoggerError::QueueClosed)
    }

    /// Persist every buffered entry to SD, with local retries.
    ///
    /// Each line gets up to three attempts; exhaustion raises a critical
    /// alert and aborts the save.
    pub async fn save_to_sd(&self) -> LoggerResult<()> {
        let directory = self.directory.read().clone();
        for entry in self.snapshot() {
            let line = entry.to_line();
            let mut attempt = 0;
            loop {
                attempt += 1;
                match self
                    .storage
                    .write_with_rotation(&directory, "logs", &line)
                    .await
                {
                    Ok(()) => break,
                    Err(err) if attempt < SD_RETRY_ATTEMPTS => {
                        warn!(%err, attempt, "SD log write failed, retrying");
                    }
                    Err(err) => {
                        error!(%err, attempt, "SD log write failed");
                        self.log_alert(
                            LogLevel::Critical,
                            "Falha persistente ao salvar logs no SD Card!",
                        );
                        return Err(LoggerError::SdExhausted {
                            attempts: SD_RETRY_ATTEMPTS,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist warning/critical entries to the non-volatile store.
    pub async fn save_critical_to_nvs(&self) -> LoggerResult<()> {
        let critical: Vec<LogEntry> = self
            .snapshot()
            .into_iter()
            .filter(|entry| entry.level >= LogLevel::Warning)
            .collect();
        let blob = serde_json::to_vec(&critical)?;
        self.kv.set_blob(NVS_NAMESPACE, NVS_KEY, &blob).await?;
        self.kv.commit().await?;
        Ok(())
    }

    /// Load previously persisted critical entries back into the ring.
    ///
    /// Returns the number of entries restored.
    pub async fn load_critical_from_nvs(&self) -> LoggerResult<usize> {
        let Some(blob) = self.kv.get_blob(NVS_NAMESPACE, NVS_KEY).await? else {
            return Ok(0);
        };
        let entries: Vec<LogEntry> = serde_json::from_slice(&blob)?;
        let count = entries.len();
        let mut ring = self.ring.lock();
        for entry in entries {
            ring.push(entry);
        }
        Ok(count)
    }

    /// Export the buffer as CSV under the log directory.
    pub async fn export_csv(&self) -> LoggerResult<()> {
        let directory = self.directory.read().clone();
        let rows: Vec<Vec<String>> = self
            .snapshot()
            .into_iter()
            .map(|entry| {
                vec![
                    entry.timestamp_ms.to_string(),
                    entry.level.to_string(),
                    entry.message,
                ]
            })
            .collect();
        let path = format!("{directory}/logs_export.csv");
        self.storage.write_csv(&path, &rows).await?;
        Ok(())
    }

    /// Export the buffer as JSON under the log directory.
    pub async fn export_json(&self) -> LoggerResult<()> {
        let directory = self.directory.read().clone();
        let value = serde_json::to_value(self.snapshot())?;
        let path = format!("{directory}/logs_export.json");
        self.storage.write_json(&path, &value).await?;
        Ok(())
    }

    /// Ship buffered logs to the fleet backend.
    // TODO: decide whether this export path is required and, if so,
    // publish the buffer through the update source's MQTT client.
    pub fn send_logs(&self) {
        info!("log export over MQTT is not implemented");
    }

    /// Spawn the periodic flush of critical entries into NVS.
    pub fn start_flush_task(self: &Arc<Self>) {
        let logger = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = logger.save_critical_to_nvs().await {
                    error!(%err, "periodic critical-log flush failed");
                }
            }
        });
        self.workers.lock().push(handle);
    }

    /// Spawn the asynchronous SD writer.
    pub fn start_async_write_task(self: &Arc<Self>) {
        let Some(mut rx) = self.async_rx.lock().take() else {
            warn!("async write task already started");
            return;
        };
        let logger = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                let directory = logger.directory.read().clone();
                if let Err(err) = logger
                    .storage
                    .write_with_rotation(&directory, "logs", &line)
                    .await
                {
                    error!(%err, "async log write failed");
                }
            }
        });
        self.workers.lock().push(handle);
    }

    /// Spawn the free-space monitor.
    pub fn start_monitor_task(self: &Arc<Self>) {
        let logger = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut error_count = 0u32;
            loop {
                ticker.tick().await;
                logger.monitor_once(&mut error_count).await;
            }
        });
        self.workers.lock().push(handle);
    }

    /// Stop all background duties.
    pub fn stop_tasks(&self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }

    async fn monitor_once(&self, error_count: &mut u32) {
        match self.storage.free_space().await {
            Ok(free) => {
                let threshold = self.free_space_threshold.load(Ordering::Relaxed);
                if free >= threshold {
                    return;
                }
                self.log_alert(
                    LogLevel::Critical,
                    "Espaço livre crítico no SD Card detectado pelo Logger!",
                );
                if self.save_to_sd().await.is_err() {
                    *error_count += 1;
                    error!(error_count, "persistent log save failure");
                } else {
                    *error_count = 0;
                }
                if *error_count >= SD_ERROR_THRESHOLD {
                    // Recovery placeholder: the counter resets and the
                    // monitor keeps watching.
                    error!("log save failure threshold reached, resetting counter");
                    *error_count = 0;
                }
            }
            Err(err) => {
                warn!(%err, "free-space query failed");
                self.log_alert(
                    LogLevel::Warning,
                    "Falha ao obter informações do sistema de arquivos no Logger!",
                );
            }
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("level", &*self.level.read())
            .field("directory", &*self.directory.read())
            .field("entries", &self.snapshot().len())
            .finish()
    }
}

fn clamp_message(mut message: String) -> String {
    if message.len() > MESSAGE_MAX_BYTES {
        let mut cut = MESSAGE_MAX_BYTES;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use canmesh_storage::testing::{ManualRtc, MemoryKvStore, MemorySdStorage};
    use std::sync::atomic::AtomicU32;

    struct Fixture {
        logger: Arc<Logger>,
        storage: Arc<MemorySdStorage>,
        kv: Arc<MemoryKvStore>,
        rtc: Arc<ManualRtc>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemorySdStorage::new());
        let kv = Arc::new(MemoryKvStore::new());
        let rtc = Arc::new(ManualRtc::starting_at(1_000));
        let logger = Logger::new(
            rtc.clone(),
            storage.clone(),
            kv.clone(),
            LoggerSettings::default(),
        );
        Fixture {
            logger,
            storage,
            kv,
            rtc,
        }
    }

    #[tokio::test]
    async fn entries_below_level_are_dropped() {
        let f = fixture();
        f.logger.set_level(LogLevel::Warning);
        f.logger.log(LogLevel::Info, "quiet");
        f.logger.log(LogLevel::Warning, "loud");

        let entries = f.logger.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "loud");
    }

    #[tokio::test]
    async fn alert_callback_fires_for_warning_and_critical_only() {
        let f = fixture();
        let fired = Arc::new(AtomicU32::new(0));
        let seen = fired.clone();
        f.logger.register_alert_callback(move |entry| {
            assert!(entry.level >= LogLevel::Warning);
            seen.fetch_add(1, Ordering::Relaxed);
        });

        f.logger.log(LogLevel::Info, "info");
        f.logger.log(LogLevel::Warning, "warning");
        f.logger.log(LogLevel::Critical, "critical");
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn log_alert_prefixes_the_message() {
        let f = fixture();
        f.logger.log_alert(LogLevel::Warning, "bus overload");
        let entries = f.logger.snapshot();
        assert_eq!(entries[0].message, "ALERTA: bus overload");
    }

    #[tokio::test]
    async fn long_messages_are_truncated() {
        let f = fixture();
        f.logger.log(LogLevel::Info, "x".repeat(500));
        assert_eq!(f.logger.snapshot()[0].message.len(), MESSAGE_MAX_BYTES);
    }

    #[tokio::test]
    async fn timestamps_come_from_the_rtc() {
        let f = fixture();
        f.rtc.set_ms(42_000);
        f.logger.log(LogLevel::Info, "stamped");
        assert_eq!(f.logger.snapshot()[0].timestamp_ms, 42_000);
    }

    #[tokio::test]
    async fn critical_entries_round_trip_through_nvs() {
        let f = fixture();
        f.logger.log(LogLevel::Info, "kept out");
        f.logger.log(LogLevel::Warning, "kept 1");
        f.logger.log(LogLevel::Critical, "kept 2");
        f.logger.save_critical_to_nvs().await.unwrap();
        assert_eq!(f.kv.commit_count(), 1);

        let restored = Logger::new(
            f.rtc.clone(),
            f.storage.clone(),
            f.kv.clone(),
            LoggerSettings::default(),
        );
        assert_eq!(restored.load_critical_from_nvs().await.unwrap(), 2);
        let entries = restored.snapshot();
        assert!(entries.iter().all(|e| e.level >= LogLevel::Warning));
    }

    #[tokio::test]
    async fn async_writer_drains_the_queue() {
        let f = fixture();
        f.logger.start_async_write_task();
        f.logger.async_write("diag summary line").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while f.storage.rotated_lines().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(f.storage.rotated_lines(), vec!["diag summary line"]);
        f.logger.stop_tasks();
    }

    #[tokio::test]
    async fn save_to_sd_retries_then_succeeds() {
        let f = fixture();
        f.logger.log(LogLevel::Info, "line");
        f.storage.fail_next_writes(2);
        f.logger.save_to_sd().await.unwrap();
        assert_eq!(f.storage.rotated_lines().len(), 1);
    }

    #[tokio::test]
    async fn save_to_sd_escalates_after_three_failures() {
        let f = fixture();
        f.logger.log(LogLevel::Info, "line");
        f.storage.fail_next_writes(3);
        let err = f.logger.save_to_sd().await.unwrap_err();
        assert!(matches!(err, LoggerError::SdExhausted { attempts: 3 }));

        let critical: Vec<_> = f
            .logger
            .snapshot()
            .into_iter()
            .filter(|e| e.level == LogLevel::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert!(critical[0].message.starts_with("ALERTA: "));
    }

    #[tokio::test]
    async fn monitor_alerts_on_low_free_space() {
        let f = fixture();
        f.storage.set_free_space(0);
        let mut error_count = 0;
        f.logger.monitor_once(&mut error_count).await;

        let entries = f.logger.snapshot();
        assert!(entries.iter().any(|e| e.level == LogLevel::Critical
            && e.message.contains("Espaço livre crítico")));
        assert_eq!(error_count, 0);
    }

    #[tokio::test]
    async fn monitor_counts_consecutive_save_failures() {
        let f = fixture();
        f.logger.log(LogLevel::Info, "payload");
        f.storage.set_free_space(0);

        let mut error_count = 0;
        // Every write fails: the low-space save cannot make progress.
        f.storage.fail_next_writes(u32::MAX);
        for _ in 0..SD_ERROR_THRESHOLD {
            f.logger.monitor_once(&mut error_count).await;
        }
        // The threshold resets the counter and the monitor keeps running.
        assert_eq!(error_count, 0);
    }
}
