//! RocksDB-backed storage engine handle
//!
//! Holding an open `Store` means holding RocksDB's exclusive `LOCK` file for
//! the location, so at most one open `Store` exists per location across every
//! cooperating process. A second open fails with [`Error::Locked`].

use crate::common::{EngineConfig, Error, Result};
use crate::engine::backend::{Backend, BatchOp, Entry, ScanRange};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Shared handle to an open database
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    db: RwLock<Option<DB>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.inner.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Store {
    /// Open the database at `path`, taking its lock.
    ///
    /// Runs on the blocking pool. Lock contention maps to [`Error::Locked`];
    /// anything else the engine reports is returned as is.
    pub async fn open(path: impl AsRef<Path>, config: &EngineConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let create_if_missing = config.create_if_missing;
        tokio::task::spawn_blocking(move || Self::open_blocking(path, create_if_missing)).await?
    }

    fn open_blocking(path: PathBuf, create_if_missing: bool) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(create_if_missing);

        let db = match DB::open(&opts, &path) {
            Ok(db) => db,
            Err(e) if is_lock_error(&e) => return Err(Error::Locked(path)),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!("Opened store at {}", path.display());
        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                db: RwLock::new(Some(db)),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn is_open(&self) -> bool {
        self.inner.db.read().unwrap().is_some()
    }

    /// Close the database and release its lock.
    ///
    /// Takes effect for every clone of this handle; later calls fail with
    /// [`Error::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let db = inner.db.write().unwrap().take();
            if let Some(db) = db {
                drop(db);
                tracing::debug!("Closed store at {}", inner.path.display());
            }
        })
        .await?;
        Ok(())
    }

    fn with_db<T>(&self, f: impl FnOnce(&DB) -> Result<T>) -> Result<T> {
        let guard = self.inner.db.read().unwrap();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(Error::Closed),
        }
    }
}

impl Backend for Store {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_db(|db| Ok(db.get(key)?))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_db(|db| Ok(db.put(key, value)?))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.with_db(|db| Ok(db.delete(key)?))
    }

    fn batch(&self, ops: &[BatchOp]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => batch.put(key, value),
                BatchOp::Delete { key } => batch.delete(key),
            }
        }
        self.with_db(|db| Ok(db.write(batch)?))
    }

    fn scan(&self, range: &ScanRange) -> Result<Vec<Entry>> {
        self.with_db(|db| {
            let mode = match (range.seek_key(), range.reverse) {
                (Some(key), false) => IteratorMode::From(key, Direction::Forward),
                (Some(key), true) => IteratorMode::From(key, Direction::Reverse),
                (None, false) => IteratorMode::Start,
                (None, true) => IteratorMode::End,
            };
            let walk = db.iterator(mode).map(|item| {
                item.map(|(k, v)| (k.into_vec(), v.into_vec()))
                    .map_err(Error::from)
            });
            range.collect(walk)
        })
    }
}

/// Fragments of the IO error RocksDB reports when its `LOCK` file is taken:
/// by another process, then by another handle in this process.
const LOCK_ERROR_PATTERNS: [&str; 2] = ["While lock file", "lock hold by current process"];

fn is_lock_error(err: &rocksdb::Error) -> bool {
    matches!(err.kind(), rocksdb::ErrorKind::IOError) && is_lock_message(&err.to_string())
}

fn is_lock_message(message: &str) -> bool {
    LOCK_ERROR_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_basic() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), &EngineConfig::default()).await.unwrap();

        store.put(b"key1", b"value1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));

        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let first = Store::open(dir.path(), &EngineConfig::default()).await.unwrap();

        let err = Store::open(dir.path(), &EngineConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_lock_contention(), "unexpected error: {}", err);

        first.close().await.unwrap();
        let second = Store::open(dir.path(), &EngineConfig::default()).await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_applies_to_clones() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), &EngineConfig::default()).await.unwrap();
        let clone = store.clone();

        store.close().await.unwrap();
        assert!(!clone.is_open());
        assert!(matches!(clone.get(b"k"), Err(Error::Closed)));
        clone.close().await.unwrap();
    }

    #[test]
    fn test_lock_messages() {
        assert!(is_lock_message(
            "IO error: While lock file: /data/LOCK: Resource temporarily unavailable"
        ));
        assert!(is_lock_message(
            "IO error: lock hold by current process, acquire time 1700000000 \
             acquiring thread 140234: /data/LOCK: No locks available"
        ));
        assert!(!is_lock_message(
            "IO error: No such file or directory: While opening a file for sequentially reading: /data/CURRENT"
        ));
    }

    #[tokio::test]
    async fn test_missing_store_without_create() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            create_if_missing: false,
        };
        let err = Store::open(dir.path().join("absent"), &config)
            .await
            .unwrap_err();
        assert!(!err.is_lock_contention());
    }

    #[tokio::test]
    async fn test_batch_and_scan() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path(), &EngineConfig::default()).await.unwrap();

        store
            .batch(&[
                BatchOp::put("a", "1"),
                BatchOp::put("b", "2"),
                BatchOp::put("c", "3"),
                BatchOp::put("d", "4"),
                BatchOp::delete("c"),
            ])
            .unwrap();

        let all = store.scan(&ScanRange::all()).unwrap();
        assert_eq!(
            all,
            vec![Entry::new("a", "1"), Entry::new("b", "2"), Entry::new("d", "4")]
        );

        let range = ScanRange {
            lt: Some(b"d".to_vec()),
            ..ScanRange::default()
        }
        .reverse();
        let keys: Vec<_> = store
            .scan(&range)
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"a".to_vec()]);

        store.close().await.unwrap();
    }
}
