#![forbid(unsafe_code)]

//! Durable key/value storage for the persisted tree.
//!
//! The store writes the whole tree as one JSON document under a fixed key
//! and fully overwrites it each time. Backends only move strings; they never
//! interpret the document.
//!
//! - [`MemoryStorage`]: in-process map. Clones share the same map, so a test
//!   (or the host) can keep a handle while the store owns another.
//! - [`FileStorage`]: one `<key>.json` file per key in a directory, written
//!   through a temporary file and renamed into place.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chatstate_core::StorageError;
use tracing::debug;

/// A durable key/value document store.
pub trait StateStorage {
    /// Read the document stored under `key`, `None` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replace the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written.
    fn save(&mut self, key: &str, document: &str) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    documents: HashMap<String, String>,
    writes: u64,
}

/// In-memory storage. Cloning shares the same documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Rc<RefCell<MemoryInner>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-populated with one document.
    #[must_use]
    pub fn with_document(key: &str, document: impl Into<String>) -> Self {
        let storage = Self::new();
        storage
            .inner
            .borrow_mut()
            .documents
            .insert(key.to_owned(), document.into());
        storage
    }

    /// Number of successful `save` calls.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.inner.borrow().writes
    }

    #[must_use]
    pub fn document(&self, key: &str) -> Option<String> {
        self.inner.borrow().documents.get(key).cloned()
    }
}

impl StateStorage for MemoryStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.document(key))
    }

    fn save(&mut self, key: &str, document: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.borrow_mut();
        inner.documents.insert(key.to_owned(), document.to_owned());
        inner.writes += 1;
        Ok(())
    }
}

/// File-backed storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Storage in `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `key`.
    ///
    /// # Errors
    ///
    /// Rejects empty keys and keys that could escape the directory.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && !key.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StorageError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl StateStorage for FileStorage {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(document) => Ok(Some(document)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_owned(),
                source,
            }),
        }
    }

    fn save(&mut self, key: &str, document: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let io_err = |source| StorageError::Io {
            key: key.to_owned(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        fs::write(&tmp, document).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        debug!(path = %path.display(), bytes = document.len(), "state document saved");
        Ok(())
    }
}
