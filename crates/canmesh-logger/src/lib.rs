//! Persistent logger of the monitor node.
//!
//! Level-filtered 100-entry ring with wall-clock timestamps from a single
//! owned RTC handle, an alert channel for warning/critical entries, and
//! three background duties: a 60 s flush of critical entries into the
//! non-volatile store, an asynchronous SD writer draining a queue of owned
//! lines, and a 30 s free-space monitor.
//!
//! This is a product feature of the node (the persisted log survives and
//! ships with the vehicle); process diagnostics use `tracing` as
//! everywhere else.

pub mod entry;
pub mod error;
pub mod logger;

pub use entry::{LogEntry, LogLevel, LOG_CAPACITY, MESSAGE_MAX_BYTES};
pub use error::{LoggerError, LoggerResult};
pub use logger::{Logger, LoggerSettings};
