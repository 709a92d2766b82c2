//! Scriptable collaborator doubles for OTA tests, shared with the
//! supervisor's test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use canmesh_storage::SdStorage;

use crate::error::{OtaError, OtaResult};
use crate::partition::OtaPartition;
use crate::source::UpdateSource;

/// In-memory update source advertising versions and serving firmware.
pub struct MockUpdateSource {
    storage: Arc<dyn SdStorage>,
    advertised: Mutex<HashMap<String, u32>>,
    firmware: Mutex<HashMap<String, Vec<u8>>>,
    subscriptions: Mutex<Vec<String>>,
    fail_downloads: AtomicU32,
}

impl MockUpdateSource {
    /// Create a source that materializes downloads into `storage`.
    pub fn new(storage: Arc<dyn SdStorage>) -> Self {
        Self {
            storage,
            advertised: Mutex::new(HashMap::new()),
            firmware: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
            fail_downloads: AtomicU32::new(0),
        }
    }

    /// Advertise a firmware version with its image on a topic.
    pub fn advertise(&self, topic: &str, version: u32, image: Vec<u8>) {
        self.advertised.lock().insert(topic.to_string(), version);
        self.firmware.lock().insert(topic.to_string(), image);
    }

    /// Topics subscribed so far.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Make the next `count` downloads fail.
    pub fn fail_next_downloads(&self, count: u32) {
        self.fail_downloads.store(count, Ordering::Relaxed);
    }
}

#[async_trait]
impl UpdateSource for MockUpdateSource {
    async fn subscribe(&self, topic: &str) -> OtaResult<()> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, _topic: &str, _payload: &[u8]) -> OtaResult<()> {
        Ok(())
    }

    async fn update_version(&self, topic: &str) -> OtaResult<Option<u32>> {
        Ok(self.advertised.lock().get(topic).copied())
    }

    async fn download_file(&self, topic: &str, filename: &str) -> OtaResult<()> {
        let failing = self
            .fail_downloads
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OtaError::source("injected download failure"));
        }
        let image = self
            .firmware
            .lock()
            .get(topic)
            .cloned()
            .ok_or_else(|| OtaError::source(format!("nothing advertised on {topic}")))?;
        self.storage.write(filename, &image).await?;
        Ok(())
    }
}

/// In-memory flash partition recording the apply sequence.
#[derive(Default)]
pub struct MockPartition {
    written: Mutex<Vec<u8>>,
    boot_set: Mutex<bool>,
    fail_step: Mutex<Option<&'static str>>,
}

impl MockPartition {
    /// Create a healthy partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the named step (`begin`, `write`, `end`, `set_boot`) fail once.
    pub fn fail_step(&self, step: &'static str) {
        *self.fail_step.lock() = Some(step);
    }

    /// Bytes written through the apply sequence.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    /// Whether the partition was marked bootable.
    pub fn boot_set(&self) -> bool {
        *self.boot_set.lock()
    }

    fn check(&self, step: &'static str) -> OtaResult<()> {
        let mut fail = self.fail_step.lock();
        if *fail == Some(step) {
            *fail = None;
            return Err(OtaError::partition(format!("injected {step} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl OtaPartition for MockPartition {
    async fn begin(&self, _size: usize) -> OtaResult<()> {
        self.check("begin")?;
        self.written.lock().clear();
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> OtaResult<()> {
        self.check("write")?;
        self.written.lock().extend_from_slice(data);
        Ok(())
    }

    async fn end(&self) -> OtaResult<()> {
        self.check("end")
    }

    async fn set_boot(&self) -> OtaResult<()> {
        self.check("set_boot")?;
        *self.boot_set.lock() = true;
        Ok(())
    }
}
