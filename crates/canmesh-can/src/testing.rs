//! Scriptable in-memory CAN driver for tests, shared with downstream
//! crates.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::driver::{CanConfig, CanDriver, DriverStatus, WireFrame};
use crate::error::{CanError, CanResult};

/// In-memory CAN controller.
///
/// Transmit outcomes can be scripted ahead of time (unscripted transmits
/// succeed), received frames are fed through [`MockDriver::push_rx`], and
/// frames transmitted with the self-reception flag loop back into the RX
/// queue, which is enough to exercise the transport's retry, checksum and
/// loopback paths.
#[derive(Debug, Default)]
pub struct MockDriver {
    transmit_script: Mutex<VecDeque<CanResult<()>>>,
    transmitted: Mutex<Vec<WireFrame>>,
    rx_frames: Mutex<VecDeque<WireFrame>>,
    rx_notify: Notify,
    status: Mutex<DriverStatus>,
    install_error: Mutex<Option<CanError>>,
    installed: AtomicBool,
    started: AtomicBool,
}

impl MockDriver {
    /// Create a healthy driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcomes of the next transmits, oldest first.
    pub fn script_transmits(&self, results: impl IntoIterator<Item = CanResult<()>>) {
        self.transmit_script.lock().extend(results);
    }

    /// Make installation fail with the given error.
    pub fn fail_install(&self, error: CanError) {
        *self.install_error.lock() = Some(error);
    }

    /// Frames successfully transmitted so far.
    pub fn transmitted(&self) -> Vec<WireFrame> {
        self.transmitted.lock().clone()
    }

    /// Feed a frame into the RX side.
    pub fn push_rx(&self, frame: WireFrame) {
        self.rx_frames.lock().push_back(frame);
        self.rx_notify.notify_one();
    }

    /// Replace the reported controller status.
    pub fn set_status(&self, status: DriverStatus) {
        *self.status.lock() = status;
    }

    /// Whether the controller is currently installed.
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Relaxed)
    }

    /// Whether the controller is currently started.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CanDriver for MockDriver {
    async fn install(&self, _config: &CanConfig) -> CanResult<()> {
        if let Some(error) = self.install_error.lock().take() {
            return Err(error);
        }
        self.installed.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn start(&self) -> CanResult<()> {
        self.started.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self) -> CanResult<()> {
        self.started.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn uninstall(&self) -> CanResult<()> {
        self.installed.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn transmit(&self, frame: &WireFrame, _timeout: Duration) -> CanResult<()> {
        if let Some(result) = self.transmit_script.lock().pop_front() {
            result?;
        }
        self.transmitted.lock().push(*frame);
        if frame.self_rx {
            self.push_rx(*frame);
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> CanResult<WireFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.rx_frames.lock().pop_front() {
                return Ok(frame);
            }
            if tokio::time::timeout_at(deadline, self.rx_notify.notified())
                .await
                .is_err()
            {
                return Err(CanError::Timeout);
            }
        }
    }

    async fn status_info(&self) -> CanResult<DriverStatus> {
        Ok(*self.status.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let driver = MockDriver::new();
        driver.script_transmits([Err(CanError::Transmit(1)), Ok(())]);

        let frame = WireFrame {
            id: 1,
            data: [0; 8],
            dlc: 0,
            extended: true,
            rtr: false,
            single_shot: false,
            self_rx: false,
        };
        assert!(driver.transmit(&frame, Duration::from_millis(10)).await.is_err());
        assert!(driver.transmit(&frame, Duration::from_millis(10)).await.is_ok());
        assert_eq!(driver.transmitted().len(), 1);
    }

    #[tokio::test]
    async fn receive_times_out_when_idle() {
        let driver = MockDriver::new();
        let result = driver.receive(Duration::from_millis(5)).await;
        assert_eq!(result.unwrap_err(), CanError::Timeout);
    }
}
