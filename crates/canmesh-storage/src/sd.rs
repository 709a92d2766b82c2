//! SD card storage seam and its host-side implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// SD card operations used by the logger, OTA orchestrator and config store.
///
/// Paths are relative to the card mount point. `write_with_rotation` keeps
/// size-capped log files: the current `<dir>/<prefix>_<n>.log` receives
/// appended lines until it would exceed the rotation size, then `n`
/// advances.
#[async_trait]
pub trait SdStorage: Send + Sync {
    /// Mount / prepare the card. Idempotent.
    async fn init(&self) -> StorageResult<()>;

    /// Write a whole file, replacing any previous content.
    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()>;

    /// Read a whole file.
    async fn read_file(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Create a directory (and parents). Idempotent.
    async fn create_directory(&self, path: &str) -> StorageResult<()>;

    /// Append one line to the current rotated log file under `dir`.
    async fn write_with_rotation(&self, dir: &str, prefix: &str, line: &str) -> StorageResult<()>;

    /// Delete a file.
    async fn delete_file(&self, path: &str) -> StorageResult<()>;

    /// Write rows as a CSV file.
    async fn write_csv(&self, path: &str, rows: &[Vec<String>]) -> StorageResult<()>;

    /// Write a JSON document.
    async fn write_json(&self, path: &str, value: &serde_json::Value) -> StorageResult<()>;

    /// Remaining free space in bytes.
    async fn free_space(&self) -> StorageResult<u64>;

    /// Adjust the rotation size used by `write_with_rotation`.
    ///
    /// Implementations without size-based rotation may ignore this.
    fn set_rotation_size(&self, _bytes: u64) {}
}

/// Host-side storage rooted in a directory.
#[derive(Debug)]
pub struct DirStorage {
    root: PathBuf,
    rotation_size: AtomicU64,
    /// Simulated card capacity; free space is capacity minus bytes stored.
    capacity: u64,
    rotation_index: Mutex<HashMap<String, u32>>,
}

impl DirStorage {
    /// Default rotation size when none is configured.
    pub const DEFAULT_ROTATION_SIZE: u64 = 1024 * 1024;

    /// Create a storage rooted at `root` with an effectively unlimited card.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_capacity(root, u64::MAX)
    }

    /// Create a storage with a fixed card capacity in bytes.
    pub fn with_capacity(root: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            root: root.into(),
            rotation_size: AtomicU64::new(Self::DEFAULT_ROTATION_SIZE),
            capacity,
            rotation_index: Mutex::new(HashMap::new()),
        }
    }

    /// Change the rotation size for `write_with_rotation`.
    pub fn set_rotation_size(&self, bytes: u64) {
        self.rotation_size.store(bytes.max(1), Ordering::Relaxed);
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn rotated_name(dir: &str, prefix: &str, index: u32) -> String {
        format!("{dir}/{prefix}_{index}.log")
    }

    async fn used_bytes(path: &Path) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        total
    }
}

#[async_trait]
impl SdStorage for DirStorage {
    async fn init(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| StorageError::io(&self.root, err))?;
        debug!(root = %self.root.display(), "storage root ready");
        Ok(())
    }

    async fn write(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(parent, err))?;
        }
        tokio::fs::write(&full, data)
            .await
            .map_err(|err| StorageError::io(&full, err))
    }

    async fn read_file(&self, path: &str) -> StorageResult<Vec<u8>> {
        let full = self.resolve(path);
        tokio::fs::read(&full)
            .await
            .map_err(|err| StorageError::io(&full, err))
    }

    async fn create_directory(&self, path: &str) -> StorageResult<()> {
        let full = self.resolve(path);
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|err| StorageError::io(&full, err))
    }

    async fn write_with_rotation(&self, dir: &str, prefix: &str, line: &str) -> StorageResult<()> {
        self.create_directory(dir).await?;
        let rotation_size = self.rotation_size.load(Ordering::Relaxed);
        let key = format!("{dir}/{prefix}");

        let mut index = { *self.rotation_index.lock().entry(key.clone()).or_insert(0) };
        let mut full = self.resolve(&Self::rotated_name(dir, prefix, index));
        let current_len = tokio::fs::metadata(&full).await.map(|m| m.len()).unwrap_or(0);
        if current_len + line.len() as u64 + 1 > rotation_size && current_len > 0 {
            index += 1;
            self.rotation_index.lock().insert(key, index);
            full = self.resolve(&Self::rotated_name(dir, prefix, index));
        }

        let mut content = tokio::fs::read_to_string(&full).await.unwrap_or_default();
        content.push_str(line);
        content.push('\n');
        tokio::fs::write(&full, content)
            .await
            .map_err(|err| StorageError::io(&full, err))
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        let full = self.resolve(path);
        tokio::fs::remove_file(&full)
            .await
            .map_err(|err| StorageError::io(&full, err))
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
        let out = serde_json::to_vec_pretty(value)?;
        self.write(path, &out).await
    }

    async fn free_space(&self) -> StorageResult<u64> {
        if self.capacity == u64::MAX {
            return Ok(u64::MAX);
        }
        let used = Self::used_bytes(&self.root).await;
        Ok(self.capacity.saturating_sub(used))
    }

    fn set_rotation_size(&self, bytes: u64) {
        DirStorage::set_rotation_size(self, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_and_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::new(dir.path());
        storage.init().await.unwrap();

        storage.write("fw/image.bin", b"abc123").await.unwrap();
        assert_eq!(storage.read_file("fw/image.bin").await.unwrap(), b"abc123");
    }

    #[tokio::test]
    async fn missing_file_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::new(dir.path());
        storage.init().await.unwrap();

        let err = storage.read_file("absent.bin").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn rotation_opens_a_new_file_when_full() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::new(dir.path());
        storage.init().await.unwrap();
        storage.set_rotation_size(16);

        storage
            .write_with_rotation("logs", "logs", "0123456789")
            .await
            .unwrap();
        storage
            .write_with_rotation("logs", "logs", "0123456789")
            .await
            .unwrap();

        assert!(dir.path().join("logs/logs_0.log").exists());
        assert!(dir.path().join("logs/logs_1.log").exists());
    }

    #[tokio::test]
    async fn free_space_reflects_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::with_capacity(dir.path(), 100);
        storage.init().await.unwrap();

        storage.write("blob.bin", &[0u8; 60]).await.unwrap();
        assert_eq!(storage.free_space().await.unwrap(), 40);
    }

    #[tokio::test]
    async fn csv_rows_are_joined() {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirStorage::new(dir.path());
        storage.init().await.unwrap();

        storage
            .write_csv(
                "export.csv",
                &[
                    vec!["1".into(), "info".into(), "ok".into()],
                    vec!["2".into(), "warn".into(), "hot".into()],
                ],
            )
            .await
            .unwrap();
        let text = String::from_utf8(storage.read_file("export.csv").await.unwrap()).unwrap();
        assert_eq!(text, "1,info,ok\n2,warn,hot\n");
    }
}
