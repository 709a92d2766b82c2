//! The diagnosis sample and its circular history.

use serde::{Deserialize, Serialize};

use canmesh_can::{DriverDiagnostics, LatencyMetrics, QueueStatus};

/// Capacity of the diagnosis history ring.
pub const DIAG_HISTORY_SIZE: usize = 50;

/// One fused snapshot of the CAN transport's health.
///
/// A zero `timestamp_us` marks an empty history slot; statistics skip those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisSample {
    /// Driver error counters and bus-off state.
    pub can: DriverDiagnostics,
    /// Transmit latency metrics.
    pub latency: LatencyMetrics,
    /// TX queue occupancy.
    pub queue: QueueStatus,
    /// Bus load percentage.
    pub bus_load: u32,
    /// Total retransmissions.
    pub retransmission_count: u32,
    /// Total collision proxies.
    pub collision_count: u32,
    /// Total transmission attempts.
    pub transmission_attempts: u32,
    /// Sample timestamp, microseconds since transport start.
    pub timestamp_us: u64,
    /// Whether any threshold was breached.
    pub abnormal: bool,
}

impl Default for DiagnosisSample {
    fn default() -> Self {
        Self {
            can: DriverDiagnostics::default(),
            latency: LatencyMetrics::default(),
            queue: QueueStatus::default(),
            bus_load: 0,
            retransmission_count: 0,
            collision_count: 0,
            transmission_attempts: 0,
            timestamp_us: 0,
            abnormal: false,
        }
    }
}

impl DiagnosisSample {
    /// One-line summary used for persisted diagnostics.
    pub fn summary(&self, wall_time_ms: u64) -> String {
        format!(
            "Diag Summary: Time={} ms, Bus Load={}%, TX_Err={}, RX_Err={}, Retrans={}, Collisions={}, Latency(Max)={} us",
            wall_time_ms,
            self.bus_load,
            self.can.tx_error_counter,
            self.can.rx_error_counter,
            self.retransmission_count,
            self.collision_count,
            self.latency.max_latency_us,
        )
    }
}

/// Fixed-size circular history of samples.
#[derive(Debug)]
pub(crate) struct HistoryRing {
    pub(crate) samples: Vec<DiagnosisSample>,
    index: usize,
}

impl HistoryRing {
    pub(crate) fn new() -> Self {
        Self {
            samples: vec![DiagnosisSample::default(); DIAG_HISTORY_SIZE],
            index: 0,
        }
    }

    /// Store a sample, overwriting the oldest slot.
    pub(crate) fn push(&mut self, sample: DiagnosisSample) {
        self.samples[self.index] = sample;
        self.index = (self.index + 1) % DIAG_HISTORY_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_index_advances_modulo_capacity() {
        let mut ring = HistoryRing::new();
        for i in 0..(DIAG_HISTORY_SIZE + 3) {
            let sample = DiagnosisSample {
                timestamp_us: i as u64 + 1,
                ..DiagnosisSample::default()
            };
            ring.push(sample);
        }
        assert_eq!(ring.index, 3);
        assert!(ring.samples.iter().all(|s| s.timestamp_us != 0));
    }

    #[test]
    fn summary_mentions_the_load_and_counters() {
        let sample = DiagnosisSample {
            bus_load: 42,
            retransmission_count: 7,
            ..DiagnosisSample::default()
        };
        let text = sample.summary(1_234);
        assert!(text.contains("Bus Load=42%"));
        assert!(text.contains("Retrans=7"));
        assert!(text.contains("Time=1234 ms"));
    }
}
