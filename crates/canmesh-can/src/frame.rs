//! CAN frame representation and payload checksum.

use serde::{Deserialize, Serialize};

use crate::error::{CanError, CanResult};

/// Maximum CAN payload length in bytes (classic CAN DLC).
pub const MAX_DATA_LENGTH: usize = 8;

/// An application-level CAN frame.
///
/// `dlc` is the number of valid bytes in `data`. `retry_count` is internal
/// transport state tracking how often the frame was retransmitted; it never
/// exceeds [`crate::MAX_RETRIES`] while the frame is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// 29-bit extended identifier.
    pub id: u32,
    /// Payload bytes; only `data[..dlc]` is meaningful.
    pub data: [u8; MAX_DATA_LENGTH],
    /// Data length code, 0–8.
    pub dlc: u8,
    /// Transport-internal retransmission counter.
    pub retry_count: u8,
}

impl CanFrame {
    /// Build a frame from an identifier and payload slice.
    ///
    /// # Errors
    ///
    /// Returns [`CanError::InvalidLength`] when the payload exceeds 8 bytes.
    pub fn new(id: u32, payload: &[u8]) -> CanResult<Self> {
        if payload.len() > MAX_DATA_LENGTH {
            return Err(CanError::InvalidLength(payload.len()));
        }
        let mut data = [0u8; MAX_DATA_LENGTH];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            data,
            dlc: payload.len() as u8,
            retry_count: 0,
        })
    }

    /// The valid payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Priority field of the identifier (high 3 bits).
    pub fn priority(&self) -> u8 {
        crate::id::decode_id(self.id).0
    }
}

/// XOR checksum over a payload, appended as the last byte in checksum mode.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, byte| acc ^ byte)
}
