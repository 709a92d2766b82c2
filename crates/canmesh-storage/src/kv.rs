//! Non-volatile key/value store seam.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{StorageError, StorageResult};

/// Blob store with explicit commit, mirroring the node's NVS partition.
///
/// Writes become visible to `get_blob` immediately; `commit` makes them
/// durable.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store a blob under `namespace`/`key`.
    async fn set_blob(&self, namespace: &str, key: &str, blob: &[u8]) -> StorageResult<()>;

    /// Fetch a blob, `None` when absent.
    async fn get_blob(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Flush pending writes to durable storage.
    async fn commit(&self) -> StorageResult<()>;
}

type BlobMap = HashMap<(String, String), Vec<u8>>;

/// Host-side KV store persisted as a JSON file on commit.
#[derive(Debug)]
pub struct FileKvStore {
    path: PathBuf,
    blobs: Mutex<BlobMap>,
}

impl FileKvStore {
    /// Open a store backed by `path`, loading any committed content.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let blobs = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let flat: HashMap<String, Vec<u8>> = serde_json::from_slice(&bytes)?;
                flat.into_iter()
                    .filter_map(|(k, v)| {
                        k.split_once('\u{1f}')
                            .map(|(ns, key)| ((ns.to_string(), key.to_string()), v))
                    })
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BlobMap::new(),
            Err(err) => return Err(StorageError::io(&path, err)),
        };
        Ok(Self {
            path,
            blobs: Mutex::new(blobs),
        })
    }
}

#[async_trait]
impl KvStore for FileKvStore {
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
        let flat: HashMap<String, Vec<u8>> = {
            self.blobs
                .lock()
                .iter()
                .map(|((ns, key), v)| (format!("{ns}\u{1f}{key}"), v.clone()))
                .collect()
        };
        let bytes = serde_json::to_vec(&flat)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(parent, err))?;
        }
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|err| StorageError::io(&self.path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blobs_survive_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvs.json");

        let store = FileKvStore::open(&path).await.unwrap();
        store
            .set_blob("logger_storage", "critical_logs", b"entries")
            .await
            .unwrap();
        store.commit().await.unwrap();

        let reopened = FileKvStore::open(&path).await.unwrap();
        let blob = reopened
            .get_blob("logger_storage", "critical_logs")
            .await
            .unwrap();
        assert_eq!(blob.as_deref(), Some(&b"entries"[..]));
    }

    #[tokio::test]
    async fn uncommitted_writes_are_visible_but_not_durable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nvs.json");

        let store = FileKvStore::open(&path).await.unwrap();
        store.set_blob("ns", "key", b"pending").await.unwrap();
        assert!(store.get_blob("ns", "key").await.unwrap().is_some());

        let reopened = FileKvStore::open(&path).await.unwrap();
        assert!(reopened.get_blob("ns", "key").await.unwrap().is_none());
    }
}
