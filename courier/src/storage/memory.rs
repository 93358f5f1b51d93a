//! In-memory [`KvStore`] for tests and the demo binary.
//!
//! Clones share the same map, so dropping a queue and reopening it over a
//! clone of the store behaves like a process restart over the same disk.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{KvStore, StorageError};

/// Shared in-process key-value map with write-failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read and write fail, as a full disk would.
    pub fn set_failing(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Return a copy of the raw bytes stored under `key`.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.values.lock().get(key).cloned()
    }

    /// Overwrite the raw bytes under `key`, bypassing failure injection.
    pub fn put_raw(&self, key: &str, bytes: Vec<u8>) {
        self.values.lock().insert(key.to_string(), bytes);
    }
}

impl KvStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected read failure".into()));
        }
        Ok(self.values.lock().get(key).cloned())
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk full".into()));
        }
        self.values.lock().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}
