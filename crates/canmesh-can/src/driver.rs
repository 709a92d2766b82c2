//! CAN controller driver seam.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CanResult;
use crate::frame::MAX_DATA_LENGTH;

/// Bus controller state, as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusState {
    /// Controller is participating in bus traffic.
    Running,
    /// Controller went bus-off after excessive transmit errors.
    BusOff,
    /// Controller is installed but stopped.
    Stopped,
    /// Controller is recovering from bus-off.
    Recovering,
}

/// Error counters and state snapshot from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStatus {
    /// Transmit error counter.
    pub tx_error_counter: u32,
    /// Receive error counter.
    pub rx_error_counter: u32,
    /// Controller state.
    pub state: BusState,
}

impl Default for DriverStatus {
    fn default() -> Self {
        Self {
            tx_error_counter: 0,
            rx_error_counter: 0,
            state: BusState::Running,
        }
    }
}

/// Acceptance filter handed to the driver at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFilter {
    /// Acceptance code compared against incoming identifiers.
    pub acceptance_code: u32,
    /// Acceptance mask; `1` bits are don't-care.
    pub acceptance_mask: u32,
}

impl CanFilter {
    /// Accept every frame.
    pub const fn accept_all() -> Self {
        Self {
            acceptance_code: 0,
            acceptance_mask: u32::MAX,
        }
    }
}

impl Default for CanFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

/// Transport configuration, also covering what the driver needs at install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanConfig {
    /// Bus bitrate in bits per second.
    pub bitrate: u32,
    /// Driver-side transmit timeout in milliseconds.
    pub transmit_timeout_ms: u32,
    /// Driver-side receive timeout in milliseconds.
    pub receive_timeout_ms: u32,
    /// Acceptance filter.
    pub filter: CanFilter,
    /// Whether transmitted frames are also received locally.
    pub self_rx: bool,
    /// Whether an XOR checksum byte is appended to every payload.
    pub use_checksum: bool,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            bitrate: 1_000_000,
            transmit_timeout_ms: 100,
            receive_timeout_ms: 100,
            filter: CanFilter::accept_all(),
            self_rx: false,
            use_checksum: false,
        }
    }
}

impl CanConfig {
    /// Driver transmit timeout as a [`Duration`].
    pub fn transmit_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.transmit_timeout_ms))
    }

    /// Driver receive timeout as a [`Duration`].
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.receive_timeout_ms))
    }
}

/// A frame as handed to / received from the controller.
///
/// Unlike [`crate::CanFrame`], this carries the wire flags and, in checksum
/// mode, the checksum byte inside `data`/`dlc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFrame {
    /// Identifier (29-bit when `extended`).
    pub id: u32,
    /// Payload including any checksum byte.
    pub data: [u8; MAX_DATA_LENGTH],
    /// Data length code including any checksum byte.
    pub dlc: u8,
    /// Extended (29-bit) identifier flag.
    pub extended: bool,
    /// Remote transmission request flag.
    pub rtr: bool,
    /// Single-shot (no automatic retransmission) flag.
    pub single_shot: bool,
    /// Self-reception request flag.
    pub self_rx: bool,
}

/// The CAN controller driver contract.
///
/// Install/start/stop/uninstall failures are non-recoverable at the
/// transport layer and are surfaced as distinct error kinds. A `receive`
/// timeout is non-fatal.
#[async_trait]
pub trait CanDriver: Send + Sync {
    /// Install the controller with the given configuration.
    async fn install(&self, config: &CanConfig) -> CanResult<()>;

    /// Start bus participation.
    async fn start(&self) -> CanResult<()>;

    /// Stop bus participation.
    async fn stop(&self) -> CanResult<()>;

    /// Uninstall the controller.
    async fn uninstall(&self) -> CanResult<()>;

    /// Put one frame on the bus, waiting at most `timeout`.
    async fn transmit(&self, frame: &WireFrame, timeout: Duration) -> CanResult<()>;

    /// Take one frame off the bus, waiting at most `timeout`.
    async fn receive(&self, timeout: Duration) -> CanResult<WireFrame>;

    /// Snapshot the controller's error counters and state.
    async fn status_info(&self) -> CanResult<DriverStatus>;
}
