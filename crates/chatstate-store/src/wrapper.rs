#![forbid(unsafe_code)]

//! Typed accessor over object nodes of the state tree.
//!
//! # Design
//!
//! A [`StateRef`] is the only way callers touch the tree. It holds a `Weak`
//! reference to its object node, the [`PropertyPath`] the node lives at, and
//! a `Weak` reference back to the store. Every read and write goes through
//! it, which is where path tracking, lazy wrapping and equality-gated
//! notification happen.
//!
//! Cloning a `StateRef` creates another handle to the **same** wrapper;
//! [`StateRef::ptr_eq`] tells whether two handles are the same wrapper.
//!
//! # Failure Modes
//!
//! - **Detached wrapper**: the node was replaced (e.g. a subtree set to
//!   `null`) or the store was dropped. Reads return `None`, writes return
//!   `false`; both log a warning.
//! - **Reserved key**: reads bypass wrapping and return the raw value;
//!   writes are refused.

use std::fmt;
use std::rc::{Rc, Weak};

use chatstate_core::{PropertyPath, StoreError, Value, deep_equal, is_reserved_key, value_depth};
use tracing::warn;

use crate::node::{Node, NodeRef, ObjectNode};
use crate::store::Shared;

/// Shared interior of a [`StateRef`].
pub(crate) struct WrapperInner {
    node: Weak<std::cell::RefCell<ObjectNode>>,
    path: PropertyPath,
    store: Weak<Shared>,
}

impl WrapperInner {
    pub(crate) fn new(node: &NodeRef, path: PropertyPath, store: Weak<Shared>) -> Self {
        Self {
            node: Rc::downgrade(node),
            path,
            store,
        }
    }

    /// Whether this wrapper was created for `node`.
    pub(crate) fn points_at(&self, node: &NodeRef) -> bool {
        std::ptr::eq(self.node.as_ptr(), Rc::as_ptr(node))
    }

    pub(crate) fn is_live(&self) -> bool {
        self.node.strong_count() > 0
    }
}

impl fmt::Debug for WrapperInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapperInner")
            .field("path", &self.path.to_string())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Result of reading a key through a [`StateRef`].
#[derive(Debug, Clone)]
pub enum StateValue {
    /// An object-shaped child, wrapped.
    Object(StateRef),
    /// Any other value: scalar, `null`, or array.
    Leaf(Value),
}

impl StateValue {
    #[must_use]
    pub fn as_object(&self) -> Option<&StateRef> {
        match self {
            Self::Object(wrapper) => Some(wrapper),
            Self::Leaf(_) => None,
        }
    }

    #[must_use]
    pub fn into_object(self) -> Option<StateRef> {
        match self {
            Self::Object(wrapper) => Some(wrapper),
            Self::Leaf(_) => None,
        }
    }

    #[must_use]
    pub fn as_leaf(&self) -> Option<&Value> {
        match self {
            Self::Leaf(value) => Some(value),
            Self::Object(_) => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_leaf().and_then(Value::as_str)
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        self.as_leaf().and_then(Value::as_f64)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.as_leaf().and_then(Value::as_bool)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Leaf(Value::Null))
    }

    /// Plain value; objects are snapshotted (`null` if the wrapper is detached).
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Leaf(value) => value,
            Self::Object(wrapper) => wrapper.to_value().unwrap_or(Value::Null),
        }
    }
}

/// Accessor over one object node of the state tree.
#[derive(Clone)]
pub struct StateRef {
    inner: Rc<WrapperInner>,
}

impl fmt::Debug for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRef")
            .field("path", &self.inner.path.to_string())
            .field("live", &self.inner.is_live())
            .finish()
    }
}

impl StateRef {
    pub(crate) fn from_inner(inner: Rc<WrapperInner>) -> Self {
        Self { inner }
    }

    /// Path of the node this wrapper observes.
    #[must_use]
    pub fn path(&self) -> &PropertyPath {
        &self.inner.path
    }

    /// Whether both handles are the same wrapper.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the observed node still exists.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.inner.is_live() && self.inner.store.strong_count() > 0
    }

    /// Read `key`. Object children come back wrapped, everything else raw.
    /// `None` means the key is absent or the read failed (logged).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<StateValue> {
        match self.try_get(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %self.inner.path, key, error = %err, "state read failed");
                None
            }
        }
    }

    /// Fallible form of [`get`](Self::get).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Detached`] if the node or store is gone and
    /// [`StoreError::Busy`] if the node is mutably borrowed.
    pub fn try_get(&self, key: &str) -> Result<Option<StateValue>, StoreError> {
        let node = self.node()?;
        let child = node
            .try_borrow()
            .map_err(|_| self.busy())?
            .get(key)
            .cloned();
        let Some(child) = child else {
            return Ok(None);
        };

        if is_reserved_key(key) {
            return Ok(Some(StateValue::Leaf(child.to_value())));
        }

        match child {
            Node::Leaf(value) => Ok(Some(StateValue::Leaf(value))),
            Node::Object(object) => {
                let shared = self.shared()?;
                let path = self.inner.path.child(key);
                Ok(Some(StateValue::Object(shared.wrap(&object, &path))))
            }
        }
    }

    /// Follow a dotted path relative to this wrapper.
    #[must_use]
    pub fn get_path(&self, dotted: &str) -> Option<StateValue> {
        let relative = PropertyPath::parse(dotted);
        let Some((last, parents)) = relative.segments().split_last() else {
            return Some(StateValue::Object(self.clone()));
        };
        let mut current = self.clone();
        for segment in parents {
            current = current.get(segment)?.into_object()?;
        }
        current.get(last)
    }

    /// Write `key`. Returns `false` if the write was refused (logged);
    /// writing a value equal to the current one succeeds without effect.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> bool {
        match self.try_set(key, value.into()) {
            Ok(_) => true,
            Err(err) => {
                warn!(path = %self.inner.path, key, error = %err, "state write refused");
                false
            }
        }
    }

    /// Fallible form of [`set`](Self::set). Returns whether the tree changed.
    ///
    /// # Errors
    ///
    /// Refuses reserved keys, values deeper than the configured limit, and
    /// writes through detached or busy wrappers. The tree is unchanged on
    /// error. Reserved keys are stricter here than in [`get`](Self::get),
    /// which reads them as raw snapshots.
    pub fn try_set(&self, key: &str, value: Value) -> Result<bool, StoreError> {
        let path = self.inner.path.child(key);
        if is_reserved_key(key) {
            return Err(StoreError::ReservedKey {
                path: path.to_string(),
            });
        }
        let shared = self.shared()?;
        let limit = shared.config().max_depth;
        if path.len() + value_depth(&value) > limit {
            return Err(StoreError::DepthExceeded { limit });
        }
        let node = self.node()?;

        let old = node
            .try_borrow()
            .map_err(|_| self.busy())?
            .get(key)
            .map(Node::to_value);
        if old.as_ref().is_some_and(|old| deep_equal(old, &value)) {
            return Ok(false);
        }

        node.try_borrow_mut()
            .map_err(|_| self.busy())?
            .insert(key.to_owned(), Node::from_value(value));
        shared.record_change(&path, old);
        Ok(true)
    }

    /// Remove `key`. Returns `false` if the removal was refused (logged).
    pub fn remove(&self, key: &str) -> bool {
        match self.try_remove(key) {
            Ok(_) => true,
            Err(err) => {
                warn!(path = %self.inner.path, key, error = %err, "state remove refused");
                false
            }
        }
    }

    /// Fallible form of [`remove`](Self::remove). Returns whether the key existed.
    ///
    /// # Errors
    ///
    /// Same conditions as [`try_set`](Self::try_set).
    pub fn try_remove(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.inner.path.child(key);
        if is_reserved_key(key) {
            return Err(StoreError::ReservedKey {
                path: path.to_string(),
            });
        }
        let shared = self.shared()?;
        let node = self.node()?;
        let removed = node.try_borrow_mut().map_err(|_| self.busy())?.remove(key);
        match removed {
            Some(old) => {
                shared.record_change(&path, Some(old.to_value()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.node()
            .ok()
            .and_then(|node| node.try_borrow().ok().map(|n| n.contains_key(key)))
            .unwrap_or(false)
    }

    /// Keys of the observed node in sorted order; empty if detached.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.node()
            .ok()
            .and_then(|node| node.try_borrow().ok().map(|n| n.keys().cloned().collect()))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.node()
            .ok()
            .and_then(|node| node.try_borrow().ok().map(|n| n.len()))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the observed subtree; `None` if detached.
    #[must_use]
    pub fn to_value(&self) -> Option<Value> {
        let node = self.node().ok()?;
        let node = node.try_borrow().ok()?;
        Some(node.to_value())
    }

    fn node(&self) -> Result<NodeRef, StoreError> {
        self.inner.node.upgrade().ok_or_else(|| StoreError::Detached {
            path: self.inner.path.to_string(),
        })
    }

    fn shared(&self) -> Result<Rc<Shared>, StoreError> {
        self.inner.store.upgrade().ok_or_else(|| StoreError::Detached {
            path: self.inner.path.to_string(),
        })
    }

    fn busy(&self) -> StoreError {
        StoreError::Busy {
            path: self.inner.path.to_string(),
        }
    }
}
