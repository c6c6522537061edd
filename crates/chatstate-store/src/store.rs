#![forbid(unsafe_code)]

//! The store handle, batching, and persistence.
//!
//! # Design
//!
//! [`Store`] is a cheap handle (`Rc`) to the shared interior: the root node,
//! the wrapper cache, the subscriber registry, the batch state, and the
//! storage backend. It is constructed once at startup and cloned into the
//! collaborators that need it; there is no process-wide singleton.
//!
//! Batches are tracked with a nesting counter. While the counter is
//! non-zero, changes are queued in the pending set instead of being
//! delivered. When the outermost batch closes, the tree is persisted once
//! and every pending path is delivered once, after the pending set has been
//! taken, so a subscriber that calls [`Store::set_state`] runs its own batch
//! to completion without touching the one being flushed.
//!
//! # Failure Modes
//!
//! - **Rejected patch**: validation runs before any mutation; the error is
//!   returned and the tree is unchanged.
//! - **Storage failure**: logged; notifications still flush; the error is
//!   returned to the caller of the operation that triggered persistence.
//! - **Panic inside [`Store::batch`]**: the batch counter is restored and the
//!   pending set of the outermost batch is discarded without notification.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use chatstate_core::{Map, PropertyPath, StoreError, Value};
use tracing::{debug, debug_span, error, warn};

use crate::cache::WrapperCache;
use crate::config::StoreConfig;
use crate::merge::{self, PendingUpdates};
use crate::node::{self, NodeRef, ObjectNode};
use crate::notifier::{self, Notifier, SubscriberId, Subscription};
use crate::storage::{MemoryStorage, StateStorage};
use crate::wrapper::StateRef;

#[derive(Debug, Default)]
struct BatchState {
    depth: usize,
    pending: PendingUpdates,
    /// Set by `set_state`; the outermost close persists even if nothing changed.
    persist_requested: bool,
}

/// What the outermost batch hands to [`Shared::flush`].
#[derive(Debug, Default)]
struct ClosedBatch {
    pending: PendingUpdates,
    persist_requested: bool,
}

/// Shared interior of a [`Store`].
pub(crate) struct Shared {
    root: NodeRef,
    cache: RefCell<WrapperCache>,
    notifier: Rc<RefCell<Notifier>>,
    batch: RefCell<BatchState>,
    storage: RefCell<Box<dyn StateStorage>>,
    config: StoreConfig,
    version: Cell<u64>,
}

impl Shared {
    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The unique wrapper for `node` at `path`.
    pub(crate) fn wrap(self: &Rc<Self>, node: &NodeRef, path: &PropertyPath) -> StateRef {
        self.cache
            .borrow_mut()
            .wrap(node, path, &Rc::downgrade(self))
    }

    /// Register a committed change at `path`. Queued while a batch is open,
    /// otherwise persisted (if configured) and delivered immediately.
    pub(crate) fn record_change(&self, path: &PropertyPath, old: Option<Value>) {
        {
            let mut batch = self.batch.borrow_mut();
            if batch.depth > 0 {
                batch.pending.record(path.clone(), old);
                return;
            }
        }

        self.bump_version();
        if self.config.persist_on_write {
            // Already logged; an immediate write has no caller to report to.
            let _ = self.persist();
        }
        let key = path.to_string();
        let new = self.value_at(path);
        notifier::deliver(&self.notifier, &key, new.as_ref(), old.as_ref());
    }

    fn value_at(&self, path: &PropertyPath) -> Option<Value> {
        node::lookup(&self.root, path.segments()).map(|n| n.to_value())
    }

    fn snapshot(&self) -> Value {
        self.root.borrow().to_value()
    }

    fn bump_version(&self) {
        self.version.set(self.version.get() + 1);
    }

    fn persist(&self) -> Result<(), StoreError> {
        let result = serde_json::to_string(&self.snapshot())
            .map_err(|err| StoreError::Serialize(err.to_string()))
            .and_then(|document| {
                self.storage
                    .borrow_mut()
                    .save(&self.config.storage_key, &document)
                    .map_err(StoreError::from)
            });
        if let Err(err) = &result {
            error!(key = %self.config.storage_key, error = %err, "failed to persist state");
        }
        result
    }

    /// Persist once and deliver every pending change.
    ///
    /// A batch with no changes persists only when a `set_state` asked for it.
    fn flush(&self, closed: ClosedBatch) -> Result<(), StoreError> {
        let ClosedBatch {
            pending,
            persist_requested,
        } = closed;
        if pending.is_empty() && !persist_requested {
            return Ok(());
        }
        if !pending.is_empty() {
            self.bump_version();
        }
        debug!(changed = pending.len(), "flushing state batch");
        let persisted = self.persist();
        for (path, old) in pending.into_entries() {
            let new = self.value_at(&path);
            let key = path.to_string();
            notifier::deliver(&self.notifier, &key, new.as_ref(), old.as_ref());
        }
        persisted
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("config", &self.config)
            .field("version", &self.version.get())
            .field("batch_depth", &self.batch.borrow().depth)
            .field("cached_wrappers", &self.cache.borrow().len())
            .finish_non_exhaustive()
    }
}

/// Restores the batch counter even on early return or unwind.
struct BatchGuard<'a> {
    shared: &'a Shared,
    closed: bool,
}

impl<'a> BatchGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        shared.batch.borrow_mut().depth += 1;
        Self {
            shared,
            closed: false,
        }
    }

    /// Leave the batch. Returns the pending set if this was the outermost one.
    fn close(mut self) -> Option<ClosedBatch> {
        self.closed = true;
        let mut batch = self.shared.batch.borrow_mut();
        batch.depth -= 1;
        (batch.depth == 0).then(|| ClosedBatch {
            pending: std::mem::take(&mut batch.pending),
            persist_requested: std::mem::take(&mut batch.persist_requested),
        })
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut batch = self.shared.batch.borrow_mut();
        batch.depth -= 1;
        if batch.depth == 0 {
            batch.pending.clear();
            batch.persist_requested = false;
        }
    }
}

/// Handle to the observable state tree.
///
/// Cloning a `Store` creates a new handle to the **same** tree.
#[derive(Clone)]
pub struct Store {
    shared: Rc<Shared>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("shared", &self.shared).finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

impl Store {
    /// Create a store seeded with `seed`, backed by in-memory storage.
    #[must_use]
    pub fn new(seed: Map<String, Value>) -> Self {
        Self::with_config(seed, StoreConfig::default(), MemoryStorage::new())
    }

    /// Create a store with explicit configuration and storage.
    ///
    /// The seed is taken as-is; it is not persisted until the first change.
    #[must_use]
    pub fn with_config(
        seed: Map<String, Value>,
        config: StoreConfig,
        storage: impl StateStorage + 'static,
    ) -> Self {
        let root = Rc::new(RefCell::new(ObjectNode::from_map(seed)));
        Self {
            shared: Rc::new(Shared {
                root,
                cache: RefCell::new(WrapperCache::new(config.cache_prune_threshold)),
                notifier: Rc::new(RefCell::new(Notifier::default())),
                batch: RefCell::new(BatchState::default()),
                storage: RefCell::new(Box::new(storage)),
                config,
                version: Cell::new(0),
            }),
        }
    }

    /// Create a store from the document persisted in `storage`.
    ///
    /// A missing, unreadable, or non-object document yields an empty tree
    /// and a warning.
    #[must_use]
    pub fn load(config: StoreConfig, storage: impl StateStorage + 'static) -> Self {
        let key = config.storage_key.clone();
        let seed = match storage.load(&key) {
            Ok(Some(document)) => match serde_json::from_str::<Value>(&document) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    warn!(%key, "persisted state is not an object; starting empty");
                    Map::new()
                }
                Err(err) => {
                    warn!(%key, error = %err, "persisted state is corrupt; starting empty");
                    Map::new()
                }
            },
            Ok(None) => Map::new(),
            Err(err) => {
                warn!(%key, error = %err, "failed to read persisted state; starting empty");
                Map::new()
            }
        };
        Self::with_config(seed, config, storage)
    }

    /// The observable root wrapper.
    #[must_use]
    pub fn state(&self) -> StateRef {
        self.shared.wrap(&self.shared.root, &PropertyPath::root())
    }

    /// Merge `patch` into the tree as one batch.
    ///
    /// Persists the whole tree exactly once, even when the patch changed
    /// nothing, then notifies each changed path once with its previous and
    /// current value. When called
    /// inside an enclosing batch (see [`batch`](Self::batch)) the changes
    /// join that batch instead.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidPatch`] if `patch` is not an object.
    /// - [`StoreError::ShapeConflict`], [`StoreError::ReservedKey`],
    ///   [`StoreError::DepthExceeded`] from validation; the tree is unchanged.
    /// - [`StoreError::Storage`] or [`StoreError::Serialize`] if persisting
    ///   failed; the tree is updated and subscribers were notified.
    pub fn set_state(&self, patch: Value) -> Result<(), StoreError> {
        let Value::Object(patch) = patch else {
            warn!("rejected state patch: not an object");
            return Err(StoreError::InvalidPatch);
        };
        let _span = debug_span!("set_state", keys = patch.len()).entered();

        if let Err(err) = merge::validate(&self.shared.root, &patch, self.shared.config.max_depth)
        {
            warn!(error = %err, "rejected state patch");
            return Err(err);
        }

        let guard = BatchGuard::enter(&self.shared);
        {
            let mut batch = self.shared.batch.borrow_mut();
            batch.persist_requested = true;
            merge::merge_into(
                &self.shared.root,
                patch,
                &PropertyPath::root(),
                &mut batch.pending,
            );
        }
        match guard.close() {
            Some(closed) => self.shared.flush(closed),
            None => Ok(()),
        }
    }

    /// Run `f` inside one batch: wrapper writes and nested
    /// [`set_state`](Self::set_state) calls are coalesced into a single
    /// persistence write and one notification per changed path.
    ///
    /// # Errors
    ///
    /// Returns a storage error if persisting the batch failed.
    pub fn batch<R>(&self, f: impl FnOnce(&StateRef) -> R) -> Result<R, StoreError> {
        let guard = BatchGuard::enter(&self.shared);
        let out = f(&self.state());
        match guard.close() {
            Some(closed) => self.shared.flush(closed).map(|()| out),
            None => Ok(out),
        }
    }

    /// Subscribe to changes at exactly `path`.
    ///
    /// The callback receives `(new_value, old_value, path)`. Dropping the
    /// returned [`Subscription`] unsubscribes.
    pub fn subscribe(
        &self,
        path: &str,
        callback: impl Fn(Option<&Value>, Option<&Value>, &str) + 'static,
    ) -> Subscription {
        let id = self
            .shared
            .notifier
            .borrow_mut()
            .subscribe(path, Rc::new(callback));
        Subscription::new(id, path, &self.shared.notifier)
    }

    /// Remove a subscriber by id. Returns whether it was registered.
    pub fn unsubscribe(&self, path: &str, id: SubscriberId) -> bool {
        self.shared.notifier.borrow_mut().unsubscribe(path, id)
    }

    #[must_use]
    pub fn subscriber_count(&self, path: &str) -> usize {
        self.shared.notifier.borrow().subscriber_count(path)
    }

    /// Number of paths with at least one subscriber.
    #[must_use]
    pub fn subscribed_paths(&self) -> usize {
        self.shared.notifier.borrow().path_count()
    }

    /// Snapshot of the value at a dotted path.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Value> {
        self.shared.value_at(&PropertyPath::parse(path))
    }

    /// Snapshot of the whole tree.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        self.shared.snapshot()
    }

    /// Increments once per effective immediate write and once per batch
    /// that changed anything. A `set_state` that changed nothing persists
    /// but does not bump the version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.shared.version.get()
    }

    /// Persist the tree now, regardless of pending changes.
    ///
    /// # Errors
    ///
    /// Returns the storage or serialization error.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.shared.persist()
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Release cached wrappers whose node is gone. Returns how many.
    pub fn prune_caches(&self) -> usize {
        self.shared.cache.borrow_mut().prune()
    }

    /// Number of wrappers currently held by the identity map.
    #[must_use]
    pub fn cached_wrappers(&self) -> usize {
        self.shared.cache.borrow().len()
    }

    /// Whether a batch is currently open.
    #[must_use]
    pub fn in_batch(&self) -> bool {
        self.shared.batch.borrow().depth > 0
    }

    /// A non-owning handle, for callbacks that need to reach the store
    /// without keeping it alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            shared: Rc::downgrade(&self.shared),
        }
    }
}

/// Non-owning handle to a [`Store`].
#[derive(Debug, Clone)]
pub struct WeakStore {
    shared: Weak<Shared>,
}

impl WeakStore {
    #[must_use]
    pub fn upgrade(&self) -> Option<Store> {
        self.shared.upgrade().map(|shared| Store { shared })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded(value: Value) -> (Store, MemoryStorage) {
        let Value::Object(seed) = value else {
            panic!("seed must be an object");
        };
        let storage = MemoryStorage::new();
        let store = Store::with_config(seed, StoreConfig::default(), storage.clone());
        (store, storage)
    }

    fn recorder(
        store: &Store,
        path: &str,
    ) -> (Subscription, Rc<RefCell<Vec<(Option<Value>, Option<Value>)>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = Rc::clone(&log);
        let sub = store.subscribe(path, move |new, old, _| {
            log_clone.borrow_mut().push((new.cloned(), old.cloned()));
        });
        (sub, log)
    }

    #[test]
    fn immediate_write_notifies_with_old_value() {
        let (store, storage) = seeded(json!({"a": 1}));
        let (_sub, log) = recorder(&store, "a");

        assert!(store.state().set("a", 2));
        assert_eq!(*log.borrow(), vec![(Some(json!(2)), Some(json!(1)))]);
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn repeated_equal_write_is_silent() {
        let (store, storage) = seeded(json!({}));
        let (_sub, log) = recorder(&store, "a");

        store.state().set("a", json!({"x": [1, 2]}));
        store.state().set("a", json!({"x": [1, 2]}));
        assert_eq!(log.borrow().len(), 1);
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn set_state_persists_once_and_notifies_old_values() {
        let (store, storage) = seeded(json!({"a": 0, "b": 0, "c": 0}));
        let (_a, log_a) = recorder(&store, "a");
        let (_b, log_b) = recorder(&store, "b");

        store
            .set_state(json!({"a": 1, "b": 2, "c": 3}))
            .expect("valid patch");
        assert_eq!(storage.write_count(), 1);
        assert_eq!(*log_a.borrow(), vec![(Some(json!(1)), Some(json!(0)))]);
        assert_eq!(*log_b.borrow(), vec![(Some(json!(2)), Some(json!(0)))]);
        assert_eq!(
            storage.document("global").map(|d| serde_json::from_str::<Value>(&d).unwrap()),
            Some(json!({"a": 1, "b": 2, "c": 3}))
        );
    }

    #[test]
    fn unchanged_patch_still_persists_once() {
        let (store, storage) = seeded(json!({"a": 1}));
        let (_sub, log) = recorder(&store, "a");
        store.set_state(json!({"a": 1})).expect("valid patch");
        assert_eq!(storage.write_count(), 1);
        assert_eq!(
            storage.document("global").map(|d| serde_json::from_str::<Value>(&d).unwrap()),
            Some(json!({"a": 1}))
        );
        assert!(log.borrow().is_empty());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn batch_without_changes_does_not_persist() {
        let (store, storage) = seeded(json!({"a": 1}));
        store
            .batch(|state| {
                state.set("a", 1);
            })
            .expect("batch");
        assert_eq!(storage.write_count(), 0);

        store
            .batch(|_| store.set_state(json!({"a": 1})).expect("inner"))
            .expect("batch");
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn batched_keys_with_dots_and_empty_keys_notify_their_own_values() {
        let (store, _storage) = seeded(json!({}));
        let (_dotted, dotted_log) = recorder(&store, "a.b");
        let (_empty, empty_log) = recorder(&store, "");

        store.set_state(json!({"a.b": 5, "": 7})).expect("patch");
        assert_eq!(*dotted_log.borrow(), vec![(Some(json!(5)), None)]);
        assert_eq!(*empty_log.borrow(), vec![(Some(json!(7)), None)]);
    }

    #[test]
    fn invalid_patches_leave_tree_untouched() {
        let (store, storage) = seeded(json!({"a": 1, "b": "text"}));
        assert!(matches!(
            store.set_state(json!([1, 2])),
            Err(StoreError::InvalidPatch)
        ));
        assert!(matches!(
            store.set_state(json!({"a": 2, "b": {"c": 1}})),
            Err(StoreError::ShapeConflict { .. })
        ));
        assert_eq!(store.snapshot(), json!({"a": 1, "b": "text"}));
        assert_eq!(storage.write_count(), 0);
        assert!(!store.in_batch());
    }

    #[test]
    fn batch_coalesces_wrapper_writes() {
        let (store, storage) = seeded(json!({"a": 0}));
        let (_sub, log) = recorder(&store, "a");

        store
            .batch(|state| {
                state.set("a", 1);
                state.set("a", 2);
                state.set("a", 3);
                assert!(log.borrow().is_empty());
            })
            .expect("batch");
        assert_eq!(*log.borrow(), vec![(Some(json!(3)), Some(json!(0)))]);
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn nested_set_state_joins_enclosing_batch() {
        let (store, storage) = seeded(json!({}));
        let (_sub, log) = recorder(&store, "a");

        store
            .batch(|_| {
                store.set_state(json!({"a": 1})).expect("inner");
                store.set_state(json!({"a": 2})).expect("inner");
                assert!(store.in_batch());
            })
            .expect("batch");
        assert_eq!(*log.borrow(), vec![(Some(json!(2)), None)]);
        assert_eq!(storage.write_count(), 1);
        assert!(!store.in_batch());
    }

    #[test]
    fn subscriber_may_call_set_state() {
        let (store, storage) = seeded(json!({}));
        let weak = store.downgrade();
        let _echo = store.subscribe("ping", move |new, _, _| {
            if let Some(store) = weak.upgrade() {
                store
                    .set_state(json!({"pong": new.cloned()}))
                    .expect("reentrant patch");
            }
        });
        let (_pong, log) = recorder(&store, "pong");

        store.set_state(json!({"ping": 7})).expect("patch");
        assert_eq!(store.get("pong"), Some(json!(7)));
        assert_eq!(*log.borrow(), vec![(Some(json!(7)), None)]);
        assert_eq!(storage.write_count(), 2);
        assert!(!store.in_batch());
    }

    #[test]
    fn panic_inside_batch_restores_counter() {
        let (store, _storage) = seeded(json!({}));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = store.batch(|state| {
                state.set("a", 1);
                if state.contains_key("a") {
                    panic!("batch body failed");
                }
            });
        }));
        assert!(result.is_err());
        assert!(!store.in_batch());

        let (_sub, log) = recorder(&store, "b");
        store.set_state(json!({"b": 1})).expect("patch");
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn load_reads_persisted_document() {
        let storage = MemoryStorage::with_document("global", r#"{"user":{"name":"Ann"}}"#);
        let store = Store::load(StoreConfig::default(), storage);
        assert_eq!(store.get("user.name"), Some(json!("Ann")));
    }

    #[test]
    fn load_falls_back_on_corrupt_document() {
        for document in ["{not json", "[1,2,3]"] {
            let storage = MemoryStorage::with_document("global", document);
            let store = Store::load(StoreConfig::default(), storage);
            assert_eq!(store.snapshot(), json!({}));
        }
    }

    #[test]
    fn persist_on_write_can_be_disabled() {
        let storage = MemoryStorage::new();
        let store = Store::with_config(
            Map::new(),
            StoreConfig::default().with_persist_on_write(false),
            storage.clone(),
        );
        store.state().set("a", 1);
        assert_eq!(storage.write_count(), 0);
        store.set_state(json!({"b": 1})).expect("patch");
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn weak_store_does_not_keep_tree_alive() {
        let store = Store::default();
        let weak = store.downgrade();
        let root = store.state();
        drop(store);
        assert!(weak.upgrade().is_none());
        assert!(!root.is_live());
        assert!(root.get("anything").is_none());
    }
}
