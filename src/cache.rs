//! Persistent key-value store used to deduplicate file uploads.
//!
//! The whole map is kept in memory behind an [`ArcSwap`] so lookups never
//! block. Every `set` rewrites the full JSON snapshot to `<path>.tmp` and
//! renames it over `<path>`; writers are serialized by a single mutex that
//! is held only for that rewrite. Producing a missing value takes a per-key
//! lock instead, so slow producers for different keys run side by side.

use crate::error::{AdapterError, Result};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

type KeyLock = Arc<Mutex<()>>;

pub struct KvStore {
    path: PathBuf,
    snapshot: ArcSwap<HashMap<String, String>>,
    write_lock: Mutex<()>,
    /// Keys whose value is being produced right now.
    in_flight: std::sync::Mutex<HashMap<String, KeyLock>>,
}

impl KvStore {
    /// Open the store at `path`. A missing or unreadable file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = load_snapshot(&path);
        tracing::debug!(path = %path.display(), entries = map.len(), "Opened key-value store");
        Self {
            path,
            snapshot: ArcSwap::from_pointee(map),
            write_lock: Mutex::new(()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.snapshot.load().get(key).cloned()
    }

    /// Insert `key` and persist the full snapshot. The new value becomes
    /// visible to readers only once it is durably on disk.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.persist_insert(key.into(), value.into()).await
    }

    /// Return the value for `key`, producing and persisting it with `init` on
    /// a miss. Concurrent callers with the same key wait for the first one and
    /// never both run `init`; callers with other keys are not held up.
    pub async fn get_or_try_insert_with<F, Fut>(&self, key: &str, init: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let key_lock = self.acquire_key(key);
        let result = self.produce(key, &key_lock, init).await;
        self.release_key(key, key_lock);
        result
    }

    async fn produce<F, Fut>(&self, key: &str, key_lock: &KeyLock, init: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let _key_guard = key_lock.lock().await;
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let value = init().await?;
        self.set(key, value.clone()).await?;
        Ok(value)
    }

    fn acquire_key(&self, key: &str) -> KeyLock {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(in_flight.entry(key.to_string()).or_default())
    }

    /// Forget the key lock once no other caller is waiting on it.
    fn release_key(&self, key: &str, key_lock: KeyLock) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held here.
        if Arc::strong_count(&key_lock) == 2 {
            in_flight.remove(key);
        }
    }

    /// Caller must hold `write_lock`.
    async fn persist_insert(&self, key: String, value: String) -> Result<()> {
        let mut next = HashMap::clone(&self.snapshot.load());
        next.insert(key, value);

        let json = serde_json::to_vec_pretty(&next)?;
        let tmp_path = tmp_path_for(&self.path);

        if let Err(e) = write_then_rename(&tmp_path, &self.path, &json).await {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to persist key-value store");
            return Err(AdapterError::cache(format!(
                "failed to write {}: {}",
                self.path.display(),
                e
            )));
        }

        self.snapshot.store(Arc::new(next));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_snapshot(path: &Path) -> HashMap<String, String> {
    if !path.exists() {
        return HashMap::new();
    }

    let parsed = std::fs::read(path)
        .map_err(AdapterError::from)
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(AdapterError::from));

    match parsed {
        Ok(map) => map,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to load key-value store, starting empty");
            HashMap::new()
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn write_then_rename(tmp_path: &Path, path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(tmp_path, contents).await?;
    tokio::fs::rename(tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_through_fresh_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv_store.json");

        let store = KvStore::open(&path);
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k"), Some("v".to_string()));

        let reloaded = KvStore::open(&path);
        assert_eq!(reloaded.get("k"), Some("v".to_string()));
        assert_eq!(reloaded.len(), 1);
    }

    #[tokio::test]
    async fn test_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv_store.json");

        let store = KvStore::open(&path);
        store.set("a", "1").await.unwrap();
        store.set("b", "2").await.unwrap();

        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("absent.json"));
        assert!(store.is_empty());
        assert_eq!(store.get("anything"), None);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv_store.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = KvStore::open(&path);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_propagates_and_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("occupied");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("inner"), b"x").unwrap();

        let store = KvStore::open(&path);
        let err = store.set("k", "v").await.unwrap_err();
        assert!(matches!(err, AdapterError::Cache { .. }));
        assert_eq!(store.get("k"), None);
    }

    #[tokio::test]
    async fn test_get_or_try_insert_with_runs_init_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KvStore::open(dir.path().join("kv_store.json")));
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                store
                    .get_or_try_insert_with("digest", || async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok("file-id".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "file-id");
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_init_does_not_block_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(KvStore::open(dir.path().join("kv_store.json")));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let slow = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .get_or_try_insert_with("image-a", || async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
                        Ok("file-a".to_string())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let begun = std::time::Instant::now();
        store.set("image-b", "file-b").await.unwrap();
        let other = store
            .get_or_try_insert_with("image-c", || async { Ok("file-c".to_string()) })
            .await
            .unwrap();
        assert!(begun.elapsed() < std::time::Duration::from_millis(500));
        assert_eq!(other, "file-c");
        assert_eq!(store.get("image-b"), Some("file-b".to_string()));
        assert_eq!(store.get("image-a"), None);

        assert_eq!(slow.await.unwrap().unwrap(), "file-a");
        assert_eq!(store.len(), 3);
        assert!(store.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_init_stores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("kv_store.json"));
        let result = store
            .get_or_try_insert_with("digest", || async { Err(AdapterError::other("upload failed")) })
            .await;
        assert!(result.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_writers_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv_store.json");
        let store = Arc::new(KvStore::open(&path));

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.set(format!("key-{i}"), format!("value-{i}")).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reloaded = KvStore::open(&path);
        assert_eq!(reloaded.len(), 16);
        assert_eq!(reloaded.get("key-7"), Some("value-7".to_string()));
    }
}
