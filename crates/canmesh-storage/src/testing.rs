//! In-memory doubles for the storage seams, shared by downstream test
//! suites.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::kv::KvStore;
use crate::rtc::Rtc;
use crate::sd::SdStorage;

/// In-memory SD card with scriptable free space and write failures.
#[derive(Debug, Default)]
pub struct MemorySdStorage {
    files: Mutex<HashMap<String, Vec<u8>>>,
    rotated_lines: Mutex<Vec<String>>,
    free_space: AtomicU64,
    fail_writes: AtomicU32,
}

impl MemorySdStorage {
    /// Create an empty card with effectively unlimited free space.
    pub fn new() -> Self {
        let storage = Self::default();
        storage.free_space.store(u64::MAX, Ordering::Relaxed);
        storage
    }

    /// Preload a file.
    pub fn insert_file(&self, path: &str, data: Vec<u8>) {
        self.files.lock().insert(path.to_string(), data);
    }

    /// Current content of a file, if present.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(path).cloned()
    }

    /// All lines appended through `write_with_rotation`, oldest first.
    pub fn rotated_lines(&self) -> Vec<String> {
        self.rotated_lines.lock().clone()
    }

    /// Override the reported free space.
    pub fn set_free_space(&self, bytes: u64) {
        self.free_space.store(bytes, Ordering::Relaxed);
    }

    /// Make the next `count` write operations fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.fail_writes.store(count, Ordering::Relaxed);
    }

    fn take_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SdStorage for MemorySdStorage {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        if self.take_failure() {
            return Err(StorageError::io(path, std::io::Error::other("injected")));
        }
        self.insert_file(path, data.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.file(path)
            .ok_or_else(|| StorageError::NotFound(path.into()))
    }

    async fn create_directory(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn write_with_rotation(&self, dir: &str, _prefix: &str, line: &str) -> StorageResult<()> {
        if self.take_failure() {
            return Err(StorageError::io(dir, std::io::Error::other("injected")));
        }
        self.rotated_lines.lock().push(line.to_string());
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        self.files
            .lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.into()))
    }

    async fn write_csv(&self, path: &str, rows: &[Vec<String>]) -> StorageResult<()> {
        let mut out = String::new();
        for row in rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        self.write(path, out.as_bytes()).await
    }

    async fn write_json(&self, path: &str, value: &serde_json::Value) -> StorageResult<()> {
        let out = serde_json::to_vec(value)?;
        self.write(path, &out).await
    }

    async fn free_space(&self) -> StorageResult<u64> {
        Ok(self.free_space.load(Ordering::Relaxed))
    }
}

/// In-memory KV store; commit only counts.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    commits: AtomicU32,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits performed.
    pub fn commit_count(&self) -> u32 {
        self.commits.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set_blob(&self, namespace: &str, key: &str, blob: &[u8]) -> StorageResult<()> {
        self.blobs
            .lock()
            .insert((namespace.to_string(), key.to_string()), blob.to_vec());
        Ok(())
    }

    async fn get_blob(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn commit(&self) -> StorageResult<()> {
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualRtc {
    ms: AtomicU64,
}

impl ManualRtc {
    /// Create a clock starting at `ms` milliseconds.
    pub fn starting_at(ms: u64) -> Self {
        let rtc = Self::default();
        rtc.ms.store(ms, Ordering::Relaxed);
        rtc
    }

    /// Set the absolute time.
    pub fn set_ms(&self, ms: u64) {
        self.ms.store(ms, Ordering::Relaxed);
    }

    /// Advance the clock.
    pub fn advance_ms(&self, delta: u64) {
        self.ms.fetch_add(delta, Ordering::Relaxed);
    }
}

impl Rtc for ManualRtc {
    fn now_ms(&self) -> u64 {
        self.ms.load(Ordering::Relaxed)
    }
}
