//! Typed configuration records, one per key group of `config.ini`.

use serde::{Deserialize, Serialize};

use crate::ecu::EcuId;

/// Logger key group (`RTC_*`, `MAX_LOG_FILE_SIZE`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// RTC I2C data pin.
    pub rtc_sda: u8,
    /// RTC I2C clock pin.
    pub rtc_scl: u8,
    /// RTC I2C port index.
    pub rtc_i2c_port: u8,
    /// Log file rotation size in bytes.
    pub max_log_file_size: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            rtc_sda: 21,
            rtc_scl: 22,
            rtc_i2c_port: 0,
            max_log_file_size: 1024 * 1024,
        }
    }
}

/// SD storage key group (`*_pin`, `max_log_file_size`, `free_space_threshold`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SPI MOSI pin.
    pub mosi_pin: u8,
    /// SPI MISO pin.
    pub miso_pin: u8,
    /// SPI clock pin.
    pub sclk_pin: u8,
    /// SPI chip-select pin.
    pub cs_pin: u8,
    /// Rotation size for log files written through the SD seam, in bytes.
    pub max_log_file_size: u64,
    /// Free-space floor in bytes; the logger raises a critical alert below it.
    pub free_space_threshold: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mosi_pin: 23,
            miso_pin: 19,
            sclk_pin: 18,
            cs_pin: 5,
            max_log_file_size: 1024 * 1024,
            free_space_threshold: 512 * 1024,
        }
    }
}

/// Routing key group (`ROUTING_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Cost assigned to recomputed neighbour routes.
    pub default_cost: u8,
    /// Fallback recompute attempts on a unicast route miss.
    pub retry_count: u8,
    /// Delay between fallback attempts, in milliseconds.
    pub retry_delay_ms: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_cost: 1,
            retry_count: 3,
            retry_delay_ms: 500,
        }
    }
}

/// OTA key group (`OTA_FIRMWARE_VERSION_*`, `MQTT_TOPIC_*`, `OTA_CHECK_INTERVAL_MS`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtaConfig {
    /// Installed firmware version of the monitor ECU.
    pub firmware_version_monitor: u32,
    /// Installed firmware version of the acceleration control ECU.
    pub firmware_version_acceleration: u32,
    /// Installed firmware version of the steering control ECU.
    pub firmware_version_steering: u32,
    /// Installed firmware version of the motor control ECU.
    pub firmware_version_motor: u32,
    /// Installed firmware version of the brake control ECU.
    pub firmware_version_brake: u32,
    /// Update topic of the monitor ECU.
    pub topic_monitor: String,
    /// Update topic of the acceleration control ECU.
    pub topic_acceleration: String,
    /// Update topic of the steering control ECU.
    pub topic_steering: String,
    /// Update topic of the motor control ECU.
    pub topic_motor: String,
    /// Update topic of the brake control ECU.
    pub topic_brake: String,
    /// Update-check cadence in milliseconds.
    pub check_interval_ms: u32,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            firmware_version_monitor: 1,
            firmware_version_acceleration: 1,
            firmware_version_steering: 1,
            firmware_version_motor: 1,
            firmware_version_brake: 1,
            topic_monitor: EcuId::Monitor.default_topic(),
            topic_acceleration: EcuId::AccelerationControl.default_topic(),
            topic_steering: EcuId::SteeringControl.default_topic(),
            topic_motor: EcuId::MotorControl.default_topic(),
            topic_brake: EcuId::BrakeControl.default_topic(),
            check_interval_ms: 60_000,
        }
    }
}

impl OtaConfig {
    /// Installed firmware version for an ECU.
    pub fn installed_version(&self, ecu: EcuId) -> u32 {
        match ecu {
            EcuId::Monitor => self.firmware_version_monitor,
            EcuId::AccelerationControl => self.firmware_version_acceleration,
            EcuId::SteeringControl => self.firmware_version_steering,
            EcuId::MotorControl => self.firmware_version_motor,
            EcuId::BrakeControl => self.firmware_version_brake,
        }
    }

    /// Record a newly installed firmware version for an ECU.
    pub fn set_installed_version(&mut self, ecu: EcuId, version: u32) {
        match ecu {
            EcuId::Monitor => self.firmware_version_monitor = version,
            EcuId::AccelerationControl => self.firmware_version_acceleration = version,
            EcuId::SteeringControl => self.firmware_version_steering = version,
            EcuId::MotorControl => self.firmware_version_motor = version,
            EcuId::BrakeControl => self.firmware_version_brake = version,
        }
    }

    /// Update topic for an ECU.
    pub fn topic(&self, ecu: EcuId) -> &str {
        match ecu {
            EcuId::Monitor => &self.topic_monitor,
            EcuId::AccelerationControl => &self.topic_acceleration,
            EcuId::SteeringControl => &self.topic_steering,
            EcuId::MotorControl => &self.topic_motor,
            EcuId::BrakeControl => &self.topic_brake,
        }
    }
}

/// Supervisor key group (`MONITOR_*`).
///
/// Zero is never a valid value for any of these; the parser keeps the
/// default and warns when it sees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorKnobs {
    /// Retry attempts around each OTA pipeline step.
    pub max_retry_count: u32,
    /// Delay between OTA retries, in milliseconds.
    pub retry_delay_ms: u32,
    /// Cadence of the configuration refresh task, in milliseconds.
    pub config_check_interval_ms: u32,
    /// Minimum interval between persisted diagnosis summaries, in milliseconds.
    pub diag_persist_interval_ms: u32,
    /// RX timeout of the CAN acquisition task, in milliseconds.
    pub can_receive_timeout_ms: u32,
    /// Cadence of the diagnosis acquisition task, in milliseconds.
    pub diag_acq_interval_ms: u32,
    /// Cadence of the communication (route refresh) task, in milliseconds.
    pub comm_interval_ms: u32,
}

impl Default for MonitorKnobs {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            retry_delay_ms: 2_000,
            config_check_interval_ms: 300_000,
            diag_persist_interval_ms: 60_000,
            can_receive_timeout_ms: 10,
            diag_acq_interval_ms: 1_000,
            comm_interval_ms: 1_000,
        }
    }
}

/// The full configuration record backing `config.ini`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Logger key group.
    pub logger: LoggerConfig,
    /// SD storage key group.
    pub storage: StorageConfig,
    /// Routing key group.
    pub routing: RoutingConfig,
    /// OTA key group.
    pub ota: OtaConfig,
    /// Supervisor key group.
    pub monitor: MonitorKnobs,
}
