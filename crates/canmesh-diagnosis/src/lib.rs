//! Diagnosis engine and alert sink of the monitor node.
//!
//! The engine periodically fuses the CAN transport's counters into
//! [`DiagnosisSample`]s, evaluates configurable thresholds, retains a
//! 50-entry circular history and notifies subscribers about abnormal
//! samples. The alert sink turns samples into levelled, ring-buffered
//! alerts and forwards each one into the persistent logger's alert
//! channel.

pub mod alert;
pub mod engine;
pub mod error;
pub mod sample;

pub use alert::{
    AlertEntry, AlertSink, AlertThresholds, ALERT_HISTORY_SIZE, MSG_BUS_LOAD, MSG_BUS_OFF,
    MSG_ERROR_RATE, MSG_RETRANSMISSIONS,
};
pub use engine::{DiagnosisEngine, DiagnosisThresholds};
pub use error::{DiagnosisError, DiagnosisResult};
pub use sample::{DiagnosisSample, DIAG_HISTORY_SIZE};
