//! JSON file storage.
//!
//! Lets the two halves of a redirect flow run in different processes: the
//! process that starts a login writes its intent to disk, the one that
//! receives the callback reads it back.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{StorageError, StoragePersistence};

/// A [`StoragePersistence`] that keeps all keys in one pretty-printed JSON
/// object on disk.
///
/// Every operation re-reads the file, so several processes may share it as
/// long as they do not write concurrently.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStorage {
    /// Opens (or lazily creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StorageError::backend(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Location of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            StorageError::backend(format!("cannot read {}: {e}", self.path.display()))
        })?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| StorageError::Serialization {
            key: self.path.display().to_string(),
            message: e.to_string(),
        })
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let content =
            serde_json::to_string_pretty(entries).map_err(|e| StorageError::Serialization {
                key: self.path.display().to_string(),
                message: e.to_string(),
            })?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|e| {
                StorageError::backend(format!("cannot write {}: {e}", self.path.display()))
            })
    }

    fn modify<F>(&self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::backend("file storage lock poisoned"))?;
        let mut entries = self.load()?;
        f(&mut entries);
        self.save(&entries)
    }
}

impl StoragePersistence for JsonFileStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StorageError::backend("file storage lock poisoned"))?;
        Ok(self.load()?.remove(key))
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.modify(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.modify(|entries| {
            entries.remove(key);
        })
    }
}
