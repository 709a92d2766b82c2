//! CAN transport layer of the canmesh monitor node.
//!
//! Wraps the CAN controller driver behind a reliable, priority-aware
//! transport: a bounded TX queue drained by a retransmitting worker,
//! latency and bus-load accounting, diagnostics counters, an RX fan-out
//! worker, and a loopback self-test. Frames carry 29-bit extended
//! identifiers laid out as `(priority:3 | module:10 | command:16)`.
//!
//! The driver itself ([`CanDriver`]) is a collaborator seam; the transport
//! never assumes more than the install/start/transmit/receive/status
//! contract.

#![warn(rust_2018_idioms)]

pub mod driver;
pub mod error;
pub mod frame;
pub mod id;
pub mod metrics;
pub mod queue;
pub mod testing;
pub mod transport;

pub use driver::{BusState, CanConfig, CanDriver, CanFilter, DriverStatus, WireFrame};
pub use error::{CanError, CanResult};
pub use frame::{xor_checksum, CanFrame, MAX_DATA_LENGTH};
pub use id::{decode_id, encode_id};
pub use metrics::{DriverDiagnostics, LatencyMetrics, QueueStatus};
pub use transport::{CanTransport, TxTaskPriority};

/// Capacity of the asynchronous TX queue.
pub const TX_QUEUE_CAPACITY: usize = 32;

/// Maximum retransmissions of a queued frame before it is reported lost.
pub const MAX_RETRIES: u8 = 3;

/// Backoff between retransmissions, in milliseconds.
pub const RETRY_BACKOFF_MS: u64 = 50;

/// Reserved identifier of the loopback self-test frame.
pub const SELF_TEST_ID: u32 = 0x0F00_0001;

/// Application-layer set-speed command identifier.
pub const CMD_SET_SPEED: u32 = 0x100;

/// Application-layer fault command identifier.
pub const CMD_FAULT: u32 = 0x200;
