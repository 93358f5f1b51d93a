//! File-backed [`KvStore`].
//!
//! Each key maps to one file below the root directory. Writes go to a
//! sibling temp file which is fsynced and then renamed over the target, so
//! a crash mid-write leaves either the old or the new value, never a mix.
//! The containing directory is fsynced after the rename so the new entry
//! survives power loss.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use super::{KvStore, StorageError};

/// File extension for stored values.
const VALUE_EXT: &str = "bin";

/// Extension for in-progress writes.
const TEMP_EXT: &str = "tmp";

/// Durable key-value store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The directory this store writes under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key such as `outbox/alice` to `<root>/outbox/alice.bin`.
    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative).with_extension(VALUE_EXT))
    }
}

impl KvStore for FileStore {
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn save(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension(TEMP_EXT);
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        sync_parent(&path)?;
        tracing::trace!(key, len = bytes.len(), "persisted value");
        Ok(())
    }
}

/// Flush the directory entry for `path`.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

/// Directories cannot be opened for syncing here; the rename is final.
#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn sync_parent(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}
