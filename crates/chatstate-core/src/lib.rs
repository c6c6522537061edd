#![forbid(unsafe_code)]

//! Core: value model, property paths, and errors for the chatstate store.
//!
//! # Role in chatstate
//! `chatstate-core` holds the pieces of the store that do not depend on
//! ownership or notification: structural equality over JSON-shaped values,
//! the dotted [`PropertyPath`] addressing scheme, the reserved-key guard,
//! and the shared [`StoreError`] taxonomy.
//!
//! # How it fits in the system
//! `chatstate-store` builds the observable tree, wrapper cache, notifier and
//! merge engine on top of these types. Collaborators (session manager,
//! settings loader) only need this crate when they want to compare values or
//! build paths without holding a store handle.

pub mod equality;
pub mod error;
pub mod path;

pub use equality::{deep_equal, option_deep_equal, value_depth};
pub use error::{StorageError, StoreError};
pub use path::{PropertyPath, RESERVED_KEYS, is_reserved_key};

/// Re-exported so downstream crates agree on one JSON value type.
pub use serde_json::{Map, Value};
