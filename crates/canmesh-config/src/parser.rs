//! Single-pass `config.ini` parser and serializer.
//!
//! Each line is `KEY=VALUE`; `#` and `;` start comments; whitespace around
//! key and value is trimmed. Unknown keys warn and are skipped, malformed
//! values warn and keep the current setting. Zero is rejected for the
//! `MONITOR_*` knobs (the supervisor cannot run with a zero interval).

use std::fmt::Write as _;

use tracing::warn;

use crate::record::MonitorConfig;

/// Parse `config.ini` text into `config`, overwriting only the keys present.
pub fn parse_into(text: &str, config: &mut MonitorConfig) {
    for raw_line in text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(line = raw_line, "config line without '=' ignored");
            continue;
        };
        apply_key(config, key.trim(), value.trim());
    }
}

/// Parse `config.ini` text on top of the default configuration.
pub fn parse(text: &str) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    parse_into(text, &mut config);
    config
}

/// Serialize the full configuration back to `config.ini` text.
///
/// The key order is fixed so that `save` followed by `load` reproduces
/// every knob exactly.
pub fn to_ini(config: &MonitorConfig) -> String {
    let mut out = String::with_capacity(1024);

    let _ = writeln!(out, "RTC_SDA={}", config.logger.rtc_sda);
    let _ = writeln!(out, "RTC_SCL={}", config.logger.rtc_scl);
    let _ = writeln!(out, "RTC_I2C_PORT={}", config.logger.rtc_i2c_port);
    let _ = writeln!(out, "MAX_LOG_FILE_SIZE={}", config.logger.max_log_file_size);

    let _ = writeln!(out, "mosi_pin={}", config.storage.mosi_pin);
    let _ = writeln!(out, "miso_pin={}", config.storage.miso_pin);
    let _ = writeln!(out, "sclk_pin={}", config.storage.sclk_pin);
    let _ = writeln!(out, "cs_pin={}", config.storage.cs_pin);
    let _ = writeln!(
        out,
        "max_log_file_size={}",
        config.storage.max_log_file_size
    );
    let _ = writeln!(
        out,
        "free_space_threshold={}",
        config.storage.free_space_threshold
    );

    let _ = writeln!(out, "ROUTING_DEFAULT_COST={}", config.routing.default_cost);
    let _ = writeln!(out, "ROUTING_RETRY_COUNT={}", config.routing.retry_count);
    let _ = writeln!(
        out,
        "ROUTING_RETRY_DELAY_MS={}",
        config.routing.retry_delay_ms
    );

    let _ = writeln!(
        out,
        "OTA_FIRMWARE_VERSION_MONITOR={}",
        config.ota.firmware_version_monitor
    );
    let _ = writeln!(
        out,
        "OTA_FIRMWARE_VERSION_ACCELERATION={}",
        config.ota.firmware_version_acceleration
    );
    let _ = writeln!(
        out,
        "OTA_FIRMWARE_VERSION_STEERING={}",
        config.ota.firmware_version_steering
    );
    let _ = writeln!(
        out,
        "OTA_FIRMWARE_VERSION_MOTOR={}",
        config.ota.firmware_version_motor
    );
    let _ = writeln!(
        out,
        "OTA_FIRMWARE_VERSION_BRAKE={}",
        config.ota.firmware_version_brake
    );
    let _ = writeln!(out, "MQTT_TOPIC_MONITOR={}", config.ota.topic_monitor);
    let _ = writeln!(
        out,
        "MQTT_TOPIC_ACCELERATION={}",
        config.ota.topic_acceleration
    );
    let _ = writeln!(out, "MQTT_TOPIC_STEERING={}", config.ota.topic_steering);
    let _ = writeln!(out, "MQTT_TOPIC_MOTOR={}", config.ota.topic_motor);
    let _ = writeln!(out, "MQTT_TOPIC_BRAKE={}", config.ota.topic_brake);
    let _ = writeln!(out, "OTA_CHECK_INTERVAL_MS={}", config.ota.check_interval_ms);

    let _ = writeln!(
        out,
        "MONITOR_MAX_RETRY_COUNT={}",
        config.monitor.max_retry_count
    );
    let _ = writeln!(
        out,
        "MONITOR_RETRY_DELAY_MS={}",
        config.monitor.retry_delay_ms
    );
    let _ = writeln!(
        out,
        "MONITOR_CONFIG_CHECK_INTERVAL_MS={}",
        config.monitor.config_check_interval_ms
    );
    let _ = writeln!(
        out,
        "MONITOR_DIAG_PERSIST_INTERVAL_MS={}",
        config.monitor.diag_persist_interval_ms
    );
    let _ = writeln!(
        out,
        "MONITOR_CAN_RECEIVE_TIMEOUT_MS={}",
        config.monitor.can_receive_timeout_ms
    );
    let _ = writeln!(
        out,
        "MONITOR_DIAG_ACQ_INTERVAL_MS={}",
        config.monitor.diag_acq_interval_ms
    );
    let _ = writeln!(
        out,
        "MONITOR_COMM_INTERVAL_MS={}",
        config.monitor.comm_interval_ms
    );

    out
}

fn strip_comment(line: &str) -> &str {
    match line.find(|c| c == '#' || c == ';') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn apply_key(config: &mut MonitorConfig, key: &str, value: &str) {
    match key {
        "RTC_SDA" => set_num(&mut config.logger.rtc_sda, key, value),
        "RTC_SCL" => set_num(&mut config.logger.rtc_scl, key, value),
        "RTC_I2C_PORT" => set_num(&mut config.logger.rtc_i2c_port, key, value),
        "MAX_LOG_FILE_SIZE" => set_num(&mut config.logger.max_log_file_size, key, value),

        "mosi_pin" => set_num(&mut config.storage.mosi_pin, key, value),
        "miso_pin" => set_num(&mut config.storage.miso_pin, key, value),
        "sclk_pin" => set_num(&mut config.storage.sclk_pin, key, value),
        "cs_pin" => set_num(&mut config.storage.cs_pin, key, value),
        "max_log_file_size" => set_num(&mut config.storage.max_log_file_size, key, value),
        "free_space_threshold" => set_num(&mut config.storage.free_space_threshold, key, value),

        "ROUTING_DEFAULT_COST" => set_num(&mut config.routing.default_cost, key, value),
        "ROUTING_RETRY_COUNT" => set_num(&mut config.routing.retry_count, key, value),
        "ROUTING_RETRY_DELAY_MS" => set_num(&mut config.routing.retry_delay_ms, key, value),

        "OTA_FIRMWARE_VERSION_MONITOR" => {
            set_num(&mut config.ota.firmware_version_monitor, key, value)
        }
        "OTA_FIRMWARE_VERSION_ACCELERATION" => {
            set_num(&mut config.ota.firmware_version_acceleration, key, value)
        }
        "OTA_FIRMWARE_VERSION_STEERING" => {
            set_num(&mut config.ota.firmware_version_steering, key, value)
        }
        "OTA_FIRMWARE_VERSION_MOTOR" => set_num(&mut config.ota.firmware_version_motor, key, value),
        "OTA_FIRMWARE_VERSION_BRAKE" => set_num(&mut config.ota.firmware_version_brake, key, value),
        "MQTT_TOPIC_MONITOR" => config.ota.topic_monitor = value.to_string(),
        "MQTT_TOPIC_ACCELERATION" => config.ota.topic_acceleration = value.to_string(),
        "MQTT_TOPIC_STEERING" => config.ota.topic_steering = value.to_string(),
        "MQTT_TOPIC_MOTOR" => config.ota.topic_motor = value.to_string(),
        "MQTT_TOPIC_BRAKE" => config.ota.topic_brake = value.to_string(),
        "OTA_CHECK_INTERVAL_MS" => set_num(&mut config.ota.check_interval_ms, key, value),

        "MONITOR_MAX_RETRY_COUNT" => set_nonzero(&mut config.monitor.max_retry_count, key, value),
        "MONITOR_RETRY_DELAY_MS" => set_nonzero(&mut config.monitor.retry_delay_ms, key, value),
        "MONITOR_CONFIG_CHECK_INTERVAL_MS" => {
            set_nonzero(&mut config.monitor.config_check_interval_ms, key, value)
        }
        "MONITOR_DIAG_PERSIST_INTERVAL_MS" => {
            set_nonzero(&mut config.monitor.diag_persist_interval_ms, key, value)
        }
        "MONITOR_CAN_RECEIVE_TIMEOUT_MS" => {
            set_nonzero(&mut config.monitor.can_receive_timeout_ms, key, value)
        }
        "MONITOR_DIAG_ACQ_INTERVAL_MS" => {
            set_nonzero(&mut config.monitor.diag_acq_interval_ms, key, value)
        }
        "MONITOR_COMM_INTERVAL_MS" => set_nonzero(&mut config.monitor.comm_interval_ms, key, value),

        _ => warn!(key, "unknown config key ignored"),
    }
}

fn set_num<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "invalid value, keeping current setting"),
    }
}

fn set_nonzero(slot: &mut u32, key: &str, value: &str) {
    match value.parse::<u32>() {
        Ok(0) => warn!(key, "zero is not a valid value, keeping current setting"),
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "invalid value, keeping current setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MonitorConfig;

    #[test]
    fn parse_reads_every_group() {
        let text = "\
# monitor node config
ROUTING_DEFAULT_COST=4
ROUTING_RETRY_COUNT=7
ROUTING_RETRY_DELAY_MS=250
OTA_FIRMWARE_VERSION_MONITOR=9
MQTT_TOPIC_MONITOR=fleet/fw/monitor
OTA_CHECK_INTERVAL_MS=30000
MONITOR_MAX_RETRY_COUNT=5
MAX_LOG_FILE_SIZE=4096
free_space_threshold=2048
";
        let config = parse(text);
        assert_eq!(config.routing.default_cost, 4);
        assert_eq!(config.routing.retry_count, 7);
        assert_eq!(config.routing.retry_delay_ms, 250);
        assert_eq!(config.ota.firmware_version_monitor, 9);
        assert_eq!(config.ota.topic_monitor, "fleet/fw/monitor");
        assert_eq!(config.ota.check_interval_ms, 30_000);
        assert_eq!(config.monitor.max_retry_count, 5);
        assert_eq!(config.logger.max_log_file_size, 4096);
        assert_eq!(config.storage.free_space_threshold, 2048);
    }

    #[test]
    fn unknown_keys_do_not_fail() {
        let config = parse("NOT_A_KEY=42\nROUTING_DEFAULT_COST=2\n");
        assert_eq!(config.routing.default_cost, 2);
    }

    #[test]
    fn comments_and_whitespace_are_tolerated() {
        let config = parse("  ROUTING_DEFAULT_COST = 3  ; inline comment\n\n# full line\n");
        assert_eq!(config.routing.default_cost, 3);
    }

    #[test]
    fn zero_monitor_knob_keeps_default() {
        let config = parse("MONITOR_RETRY_DELAY_MS=0\n");
        assert_eq!(
            config.monitor.retry_delay_ms,
            MonitorConfig::default().monitor.retry_delay_ms
        );
    }

    #[test]
    fn malformed_value_keeps_default() {
        let config = parse("ROUTING_RETRY_COUNT=many\n");
        assert_eq!(
            config.routing.retry_count,
            MonitorConfig::default().routing.retry_count
        );
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let mut config = MonitorConfig::default();
        config.routing.default_cost = 9;
        config.ota.firmware_version_brake = 4;
        config.ota.topic_steering = "x/y/z".to_string();
        config.monitor.comm_interval_ms = 1234;
        config.storage.cs_pin = 15;

        let reparsed = parse(&to_ini(&config));
        assert_eq!(reparsed, config);
    }
}
