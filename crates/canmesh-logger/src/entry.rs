//! Log levels, entries and the fixed-size ring.

use serde::{Deserialize, Serialize};

/// Capacity of the in-memory log ring.
pub const LOG_CAPACITY: usize = 100;

/// Maximum stored message length in bytes; longer messages are truncated.
pub const MESSAGE_MAX_BYTES: usize = 128;

/// Severity of a log entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum LogLevel {
    /// Informational.
    #[default]
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate attention; mirrored to non-volatile storage.
    Critical,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// One buffered log entry.
///
/// A zero timestamp marks an empty ring slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch, from the RTC.
    pub timestamp_ms: u64,
    /// Severity.
    pub level: LogLevel,
    /// Message, at most [`MESSAGE_MAX_BYTES`] bytes.
    pub message: String,
}

impl LogEntry {
    /// Whether this slot holds a real entry.
    pub fn is_valid(&self) -> bool {
        self.timestamp_ms != 0
    }

    /// Render as the `timestamp,level,message` line used for SD persistence.
    pub fn to_line(&self) -> String {
        format!("{},{},{}", self.timestamp_ms, self.level, self.message)
    }
}

/// Fixed-size overwriting ring of log entries.
#[derive(Debug)]
pub(crate) struct LogRing {
    entries: Vec<LogEntry>,
    index: usize,
}

impl LogRing {
    pub(crate) fn new() -> Self {
        Self {
            entries: vec![LogEntry::default(); LOG_CAPACITY],
            index: 0,
        }
    }

    /// Store an entry, silently overwriting the oldest slot.
    pub(crate) fn push(&mut self, entry: LogEntry) {
        self.entries[self.index] = entry;
        self.index = (self.index + 1) % LOG_CAPACITY;
    }

    /// Valid entries in slot order.
    pub(crate) fn valid_entries(&self) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.is_valid())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: u64) -> LogEntry {
        LogEntry {
            timestamp_ms: ts,
            level: LogLevel::Info,
            message: format!("entry {ts}"),
        }
    }

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Critical);
    }

    #[test]
    fn ring_overwrites_silently_past_capacity() {
        let mut ring = LogRing::new();
        for ts in 1..=(LOG_CAPACITY as u64 + 50) {
            ring.push(entry(ts));
        }
        let valid = ring.valid_entries();
        assert_eq!(valid.len(), LOG_CAPACITY);
        // The 50 oldest entries were replaced.
        assert!(valid.iter().all(|e| e.timestamp_ms > 50));
    }

    #[test]
    fn partial_fill_reports_exact_count() {
        let mut ring = LogRing::new();
        for ts in 1..=7 {
            ring.push(entry(ts));
        }
        assert_eq!(ring.valid_entries().len(), 7);
    }
}
