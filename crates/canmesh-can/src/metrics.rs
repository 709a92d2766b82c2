//! Latency, queue and diagnostics snapshots.

use serde::{Deserialize, Serialize};

/// Transmit latency statistics, sampled by the TX worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyMetrics {
    /// Number of successful transmissions sampled.
    pub num_samples: u32,
    /// Sum of all sampled latencies, microseconds.
    pub total_latency_us: i64,
    /// Smallest sampled latency, microseconds.
    pub min_latency_us: i64,
    /// Largest sampled latency, microseconds.
    pub max_latency_us: i64,
}

impl Default for LatencyMetrics {
    fn default() -> Self {
        Self {
            num_samples: 0,
            total_latency_us: 0,
            min_latency_us: i64::MAX,
            max_latency_us: 0,
        }
    }
}

impl LatencyMetrics {
    /// Fold one latency sample into the metrics.
    pub fn record(&mut self, latency_us: i64) {
        self.num_samples += 1;
        self.total_latency_us += latency_us;
        if latency_us < self.min_latency_us {
            self.min_latency_us = latency_us;
        }
        if latency_us > self.max_latency_us {
            self.max_latency_us = latency_us;
        }
    }
}

/// TX queue occupancy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Frames currently waiting.
    pub messages_waiting: usize,
    /// Queue capacity.
    pub queue_capacity: usize,
}

/// Diagnostics record derived from the driver status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDiagnostics {
    /// Transmit error counter.
    pub tx_error_counter: u32,
    /// Receive error counter.
    pub rx_error_counter: u32,
    /// Whether the controller reported bus-off.
    pub bus_off: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tracks_min_max_and_total() {
        let mut metrics = LatencyMetrics::default();
        metrics.record(120);
        metrics.record(40);
        metrics.record(300);

        assert_eq!(metrics.num_samples, 3);
        assert_eq!(metrics.total_latency_us, 460);
        assert_eq!(metrics.min_latency_us, 40);
        assert_eq!(metrics.max_latency_us, 300);
    }
}
