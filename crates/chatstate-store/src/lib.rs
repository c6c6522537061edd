#![forbid(unsafe_code)]

//! Reactive global state store for the chat client.
//!
//! This crate provides the observable state tree shared by the session
//! manager, settings loader and UI glue:
//!
//! - [`Store`]: the single long-lived store handle. Constructed once at
//!   startup and cloned into collaborators; clones share the same tree.
//! - [`StateRef`]: accessor over one object node of the tree. Reads wrap
//!   nested objects lazily; writes are equality-gated and notify by path.
//! - [`Subscription`]: RAII guard for a path subscriber.
//! - [`StateStorage`]: durable key/value backend the tree is persisted to.
//!
//! # Architecture
//!
//! The tree lives in `Rc<RefCell<..>>` nodes owned by their parents. The
//! wrapper cache maps each object node to exactly one [`StateRef`] but only
//! holds the node weakly, so detached subtrees are reclaimed. Subscribers
//! are keyed by dotted path and invoked outside every internal borrow, which
//! lets a callback read the store, write to it, or call
//! [`Store::set_state`] again.
//!
//! # Invariants
//!
//! 1. Requesting the wrapper of the same live object node twice yields the
//!    same [`StateRef`].
//! 2. Writing a value deep-equal to the current value is a no-op (no
//!    mutation, no notification, no persistence).
//! 3. Within a batch, each changed path is notified exactly once, with the
//!    value it held before the batch and the value it holds after.
//! 4. A batch persists the tree at most once; `set_state` always persists
//!    exactly once.
//! 5. A path with no subscribers has no entry in the subscriber map.
//! 6. A rejected patch leaves the tree untouched.

pub mod config;
pub mod storage;
pub mod store;
pub mod wrapper;

mod cache;
mod merge;
mod node;
mod notifier;

pub use chatstate_core::{PropertyPath, StorageError, StoreError, Value, deep_equal};
pub use config::StoreConfig;
pub use notifier::{SubscriberId, Subscription};
pub use storage::{FileStorage, MemoryStorage, StateStorage};
pub use store::{Store, WeakStore};
pub use wrapper::{StateRef, StateValue};
