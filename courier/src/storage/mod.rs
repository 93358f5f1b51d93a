//! Local persistence collaborator.
//!
//! The outbound queue needs a synchronous key-value store whose writes have
//! reached durable storage by the time `save` returns. Implementations:
//! - [`file::FileStore`]: one file per key, written atomically
//! - [`memory::MemoryStore`]: shared in-process map for tests and demos

pub mod file;
pub mod memory;

/// Errors raised by a [`KvStore`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The key cannot be mapped to a storage location.
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    /// The underlying storage is full or unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// An underlying I/O error occurred.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous, durable key-value persistence.
///
/// `save` must not return `Ok` until the bytes would survive a process
/// kill. Both methods are expected to be fast enough to call from inside
/// an async task.
pub trait KvStore: Send + Sync + 'static {
    /// Load the value stored under `key`, or `None` if it was never written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the value exists but cannot be read.
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the write could not be made durable.
    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;
}
