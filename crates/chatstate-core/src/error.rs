#![forbid(unsafe_code)]

//! Error taxonomy shared by the store and its storage backends.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Surface |
//! |---------|-------|---------|
//! | Read failure | Detached wrapper, busy node | Logged, read yields `None` |
//! | Write failure | Reserved key, detached wrapper, too deep | Logged, `set` yields `false` |
//! | Merge failure | Patch shape conflicts with tree | `set_state` returns `Err`, tree untouched |
//! | Storage failure | I/O or serialization | Logged, returned after notifications flush |
//!
//! None of these are meant for end users; they are operational signals.

use std::fmt;
use std::io;

/// Errors from store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The patch passed to `set_state` is not an object.
    InvalidPatch,
    /// A patch object targets a path that currently holds a scalar or array.
    ShapeConflict { path: String },
    /// A write or patch used one of the reserved key names.
    ///
    /// Only writes are refused; reads of reserved keys return raw snapshots.
    ReservedKey { path: String },
    /// A value nests deeper than the configured limit.
    DepthExceeded { limit: usize },
    /// A wrapper outlived the node (or store) it points at.
    Detached { path: String },
    /// A node was already borrowed; only reachable through reentrant misuse.
    Busy { path: String },
    /// The tree could not be serialized for persistence.
    Serialize(String),
    /// The durable storage backend failed.
    Storage(StorageError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPatch => write!(f, "state patch must be an object"),
            Self::ShapeConflict { path } => {
                write!(f, "patch object targets non-object value at '{path}'")
            }
            Self::ReservedKey { path } => write!(f, "reserved key in path '{path}'"),
            Self::DepthExceeded { limit } => write!(f, "value nests deeper than {limit} levels"),
            Self::Detached { path } => write!(f, "wrapper at '{path}' is detached from the tree"),
            Self::Busy { path } => write!(f, "node at '{path}' is already borrowed"),
            Self::Serialize(msg) => write!(f, "serialize error: {msg}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// Errors from durable storage backends.
#[derive(Debug)]
pub enum StorageError {
    /// The key cannot be mapped onto the backend (e.g. contains a path separator).
    InvalidKey(String),
    /// Underlying I/O failed.
    Io { key: String, source: io::Error },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey(key) => write!(f, "invalid storage key '{key}'"),
            Self::Io { key, source } => write!(f, "i/o error for key '{key}': {source}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::InvalidKey(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn display_names_the_path() {
        let err = StoreError::ShapeConflict {
            path: "user.name".into(),
        };
        assert_eq!(
            err.to_string(),
            "patch object targets non-object value at 'user.name'"
        );
    }

    #[test]
    fn storage_errors_chain() {
        let err = StoreError::from(StorageError::Io {
            key: "global".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        });
        assert!(err.to_string().contains("global"));
        let source = err.source().expect("storage source");
        assert!(source.source().is_some());
    }
}
