#![forbid(unsafe_code)]

//! Validated deep merge of a partial patch into the tree.
//!
//! # Design
//!
//! Merging is two passes. [`validate`] walks the patch against the current
//! tree without mutating anything and rejects patches that cannot be applied
//! in full. [`merge_into`] then applies the patch, which cannot fail, so a
//! rejected patch never leaves the tree half-mutated.
//!
//! Merge rules per key:
//!
//! | Patch value | Current value | Result |
//! |-------------|---------------|--------|
//! | `null` | not `null` | assign `null`, mark pending |
//! | `null` | `null` | skip |
//! | object | object | recurse |
//! | object | absent or `null` | assign `{}`, mark pending, recurse |
//! | object | scalar or array | rejected by [`validate`] |
//! | other | deep-equal | skip |
//! | other | different | assign, mark pending |

use std::collections::HashMap;

use chatstate_core::{Map, PropertyPath, StoreError, Value, deep_equal, is_reserved_key, value_depth};

use crate::node::{Node, NodeRef, ObjectNode};

/// Paths changed during an open batch, in first-change order, each with the
/// value it held before its first change.
#[derive(Debug, Default)]
pub(crate) struct PendingUpdates {
    order: Vec<PropertyPath>,
    previous: HashMap<PropertyPath, Option<Value>>,
}

impl PendingUpdates {
    /// Record a change. Later changes to the same path keep the first old value.
    pub(crate) fn record(&mut self, path: PropertyPath, old: Option<Value>) {
        if !self.previous.contains_key(&path) {
            self.order.push(path.clone());
            self.previous.insert(path, old);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.previous.clear();
    }

    /// Consume into `(path, old_value)` pairs in first-change order.
    pub(crate) fn into_entries(mut self) -> Vec<(PropertyPath, Option<Value>)> {
        self.order
            .drain(..)
            .map(|path| {
                let old = self.previous.remove(&path).flatten();
                (path, old)
            })
            .collect()
    }
}

/// Check that `patch` can be merged into `root` in full.
///
/// # Errors
///
/// - [`StoreError::DepthExceeded`] if the patch nests deeper than `max_depth`.
/// - [`StoreError::ReservedKey`] if any patch key is reserved.
/// - [`StoreError::ShapeConflict`] if a patch object targets a scalar or array.
pub(crate) fn validate(
    root: &NodeRef,
    patch: &Map<String, Value>,
    max_depth: usize,
) -> Result<(), StoreError> {
    let depth = 1 + patch.values().map(value_depth).max().unwrap_or(0);
    if depth > max_depth {
        return Err(StoreError::DepthExceeded { limit: max_depth });
    }
    let mut path = PropertyPath::root();
    validate_at(Some(root), patch, &mut path)
}

fn validate_at(
    node: Option<&NodeRef>,
    patch: &Map<String, Value>,
    path: &mut PropertyPath,
) -> Result<(), StoreError> {
    for (key, value) in patch {
        path.push(key);
        if is_reserved_key(key) {
            return Err(StoreError::ReservedKey {
                path: path.to_string(),
            });
        }
        if let Value::Object(child_patch) = value {
            let current = node.and_then(|n| n.borrow().get(key).cloned());
            match current {
                Some(Node::Object(child)) => validate_at(Some(&child), child_patch, path)?,
                Some(Node::Leaf(Value::Null)) | None => validate_at(None, child_patch, path)?,
                Some(Node::Leaf(_)) => {
                    return Err(StoreError::ShapeConflict {
                        path: path.to_string(),
                    });
                }
            }
        }
        path.pop();
    }
    Ok(())
}

/// Apply a validated patch beneath `node`, recording changed paths.
pub(crate) fn merge_into(
    node: &NodeRef,
    patch: Map<String, Value>,
    path: &PropertyPath,
    pending: &mut PendingUpdates,
) {
    for (key, value) in patch {
        let child_path = path.child(&key);
        let current = node.borrow().get(&key).cloned();
        match value {
            Value::Null => {
                if current.as_ref().is_some_and(Node::is_null) {
                    continue;
                }
                let old = current.map(|n| n.to_value());
                node.borrow_mut().insert(key, Node::Leaf(Value::Null));
                pending.record(child_path, old);
            }
            Value::Object(child_patch) => {
                let target = match current {
                    Some(Node::Object(existing)) => existing,
                    other => {
                        let fresh = ObjectNode::new_ref();
                        node.borrow_mut().insert(key, Node::Object(fresh.clone()));
                        pending.record(child_path.clone(), other.map(|n| n.to_value()));
                        fresh
                    }
                };
                merge_into(&target, child_patch, &child_path, pending);
            }
            other => {
                let old = current.map(|n| n.to_value());
                if old.as_ref().is_some_and(|old| deep_equal(old, &other)) {
                    continue;
                }
                node.borrow_mut().insert(key, Node::from_value(other));
                pending.record(child_path, old);
            }
        }
    }
}
