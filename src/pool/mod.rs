//! Named, persistent shared key-value pool with TTL and optional
//! encryption
//!
//! A pool is a memory-mapped file of frames shared by every process
//! that opens the same name. Mutations serialize through
//! an advisory whole-file lock; attached processes observe each other
//! through a generation counter in the header. Values are encoded
//! through the [`crate::value`] codec and, when the pool was opened
//! with a key, sealed by the [`crate::crypto`] transformer.

mod config;
mod layout;
mod store;
mod sweeper;

pub use config::{ErrorSink, PoolConfig};
pub use store::EntryMeta;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::crypto::Cipher;
use crate::error::{MventError, Result};
use crate::lock::FileLock;
use crate::value::{decode_value, encode_value, Value};
use crate::worker::{Worker, JOIN_WAIT};

use store::PoolStore;

/// Wall-clock UNIX epoch nanoseconds, the timestamp domain of frames
pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Usage counters reported by [`SharedPool::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live entries currently in the log
    pub entry_count: usize,
    /// Bytes consumed by the frame log
    pub bytes_used: u64,
    /// Bytes remaining before the next compaction or `Full`
    pub bytes_free: u64,
    /// Entries tombstoned by this process's sweeper
    pub expired_swept: u64,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    cipher: Option<Cipher>,
    store: Mutex<PoolStore>,
    pub(crate) stopped: AtomicBool,
    pub(crate) expired_swept: AtomicU64,
    sweeper: Mutex<Option<Worker>>,
}

impl PoolInner {
    /// Run `op` against the store with the file lock held and the index
    /// synced to the latest generation
    pub(crate) fn locked<T>(&self, op: impl FnOnce(&mut PoolStore) -> Result<T>) -> Result<T> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MventError::Stopped);
        }
        let mut store = self.store.lock().unwrap();
        let lock = FileLock::new(store.fd(), self.config.lock_timeout);
        let _guard = lock.acquire()?;
        store.sync()?;
        op(&mut store)
    }

    fn encode_payload(&self, value: &Value) -> Result<Vec<u8>> {
        let bytes = encode_value(value)?;
        match &self.cipher {
            Some(cipher) => cipher.seal(&bytes),
            None => Ok(bytes),
        }
    }

    fn decode_payload(&self, bytes: &[u8]) -> Result<Value> {
        match &self.cipher {
            Some(cipher) => decode_value(&cipher.open(bytes)?),
            None => decode_value(bytes),
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(worker) = self.sweeper.lock().unwrap().take() {
            self.stopped.store(true, Ordering::SeqCst);
            worker.stop(JOIN_WAIT);
        }
    }
}

/// Handle to a named shared pool; clones share one attachment
#[derive(Clone)]
pub struct SharedPool {
    inner: Arc<PoolInner>,
}

impl SharedPool {
    /// Idempotent attach: creates the backing file if absent, otherwise
    /// opens it (the existing capacity wins over the configured one)
    pub fn open(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let path = config.backing_path();
        let store = PoolStore::open(&path, config.capacity, config.lock_timeout)?;
        let cipher = config.encryption_key.as_ref().map(Cipher::new);

        let inner = Arc::new(PoolInner {
            config,
            cipher,
            store: Mutex::new(store),
            stopped: AtomicBool::new(false),
            expired_swept: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        });

        let worker = sweeper::spawn(&inner)?;
        *inner.sweeper.lock().unwrap() = Some(worker);

        Ok(Self { inner })
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Configuration the pool was opened with
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Store a value under `key`, optionally expiring after `ttl`
    pub fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let payload = self.inner.encode_payload(value)?;
        let ttl_ns = ttl_to_ns(ttl);
        self.inner
            .locked(|store| store.set(key, &payload, ttl_ns, now_ns()))?;
        Ok(())
    }

    /// Fetch the value under `key`; `None` for missing or expired entries
    ///
    /// The lock is held only to copy the frame; decryption and decoding
    /// happen after release.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw = self.inner.locked(|store| Ok(store.get(key, now_ns())))?;
        match raw {
            Some((bytes, _)) => Ok(Some(self.inner.decode_payload(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a value together with its creation time, TTL, and version
    pub fn get_with_meta(&self, key: &str) -> Result<Option<(Value, EntryMeta)>> {
        let raw = self.inner.locked(|store| Ok(store.get(key, now_ns())))?;
        match raw {
            Some((bytes, meta)) => Ok(Some((self.inner.decode_payload(&bytes)?, meta))),
            None => Ok(None),
        }
    }

    /// Atomic read-modify-write under one lock acquisition
    ///
    /// `op` receives the current live value (if any) and returns the
    /// replacement, which is stored and handed back.
    pub fn update(
        &self,
        key: &str,
        ttl: Option<Duration>,
        op: impl FnOnce(Option<Value>) -> Value,
    ) -> Result<Value> {
        let inner = &self.inner;
        let ttl_ns = ttl_to_ns(ttl);
        inner.locked(|store| {
            let current = match store.get(key, now_ns()) {
                Some((bytes, _)) => Some(inner.decode_payload(&bytes)?),
                None => None,
            };
            let next = op(current);
            let payload = inner.encode_payload(&next)?;
            store.set(key, &payload, ttl_ns, now_ns())?;
            Ok(next)
        })
    }

    /// Remove an entry; true iff a live entry was removed
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.inner.locked(|store| store.delete(key, now_ns()))
    }

    /// Remove all entries
    pub fn clear(&self) -> Result<()> {
        self.inner.locked(|store| {
            store.clear();
            Ok(())
        })
    }

    /// Cheap map of live keys to versions, the watcher's comparison input
    pub fn snapshot(&self) -> Result<HashMap<String, u64>> {
        self.inner.locked(|store| Ok(store.snapshot(now_ns())))
    }

    /// Usage counters
    pub fn stats(&self) -> Result<PoolStats> {
        let (entry_count, bytes_used, bytes_free) =
            self.inner.locked(|store| Ok(store.stats()))?;
        Ok(PoolStats {
            entry_count,
            bytes_used,
            bytes_free,
            expired_swept: self.inner.expired_swept.load(Ordering::Relaxed),
        })
    }

    /// Stop the sweeper and refuse further operations
    ///
    /// Idempotent. The mapping itself is released when the last clone of
    /// this handle drops.
    pub fn cleanup(&self) -> Result<()> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(worker) = self.inner.sweeper.lock().unwrap().take() {
            worker.stop(JOIN_WAIT);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPool")
            .field("name", &self.inner.config.name)
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn ttl_to_ns(ttl: Option<Duration>) -> u64 {
    // Duration::ZERO still expires, as soon as possible
    ttl.map(|d| (d.as_nanos() as u64).max(1)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pool_in(dir: &TempDir, name: &str) -> SharedPool {
        SharedPool::open(
            PoolConfig::new(name)
                .with_directory(dir.path())
                .with_capacity(64 * 1024),
        )
        .unwrap()
    }

    #[test]
    fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir, "basic");

        let value = Value::map([("name", Value::from("Bob"))]);
        pool.set("user", &value, None).unwrap();
        assert_eq!(pool.get("user").unwrap(), Some(value));
        assert!(pool.delete("user").unwrap());
        assert_eq!(pool.get("user").unwrap(), None);
    }

    #[test]
    fn test_get_with_meta_reports_versions() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir, "meta");

        pool.set("k", &Value::from(1), None).unwrap();
        pool.set("k", &Value::from(2), None).unwrap();
        let (value, meta) = pool.get_with_meta("k").unwrap().unwrap();
        assert_eq!(value, Value::from(2));
        assert_eq!(meta.version, 2);
        assert_eq!(meta.ttl_ns, 0);
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir, "update");

        let out = pool
            .update("counter", None, |cur| {
                let n = cur.as_ref().and_then(Value::as_int).unwrap_or(0);
                Value::from(n + 1)
            })
            .unwrap();
        assert_eq!(out, Value::from(1));

        let out = pool
            .update("counter", None, |cur| {
                let n = cur.as_ref().and_then(Value::as_int).unwrap_or(0);
                Value::from(n + 1)
            })
            .unwrap();
        assert_eq!(out, Value::from(2));
    }

    #[test]
    fn test_stopped_after_cleanup() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir, "stopped");

        pool.cleanup().unwrap();
        assert!(matches!(
            pool.set("k", &Value::Null, None),
            Err(MventError::Stopped)
        ));
        assert!(matches!(pool.get("k"), Err(MventError::Stopped)));
        // Idempotent
        pool.cleanup().unwrap();
    }

    #[test]
    fn test_encrypted_pool_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pool = SharedPool::open(
            PoolConfig::new("secure")
                .with_directory(dir.path())
                .with_encryption_key([9u8; 32]),
        )
        .unwrap();

        let value = Value::from("classified");
        pool.set("doc", &value, None).unwrap();
        assert_eq!(pool.get("doc").unwrap(), Some(value));
    }

    #[test]
    fn test_wrong_key_yields_decrypt_error() {
        let dir = TempDir::new().unwrap();
        let good = SharedPool::open(
            PoolConfig::new("secure2")
                .with_directory(dir.path())
                .with_encryption_key([1u8; 32]),
        )
        .unwrap();
        good.set("doc", &Value::from("x"), None).unwrap();

        let bad = SharedPool::open(
            PoolConfig::new("secure2")
                .with_directory(dir.path())
                .with_encryption_key([2u8; 32]),
        )
        .unwrap();
        assert!(matches!(
            bad.get("doc"),
            Err(MventError::Decrypt { .. })
        ));
    }

    #[test]
    fn test_stats_shape() {
        let dir = TempDir::new().unwrap();
        let pool = pool_in(&dir, "stats");

        let before = pool.stats().unwrap();
        assert_eq!(before.entry_count, 0);

        pool.set("a", &Value::from(1), None).unwrap();
        let after = pool.stats().unwrap();
        assert_eq!(after.entry_count, 1);
        assert!(after.bytes_used > before.bytes_used);
        assert!(after.bytes_free < before.bytes_free);
    }
}
