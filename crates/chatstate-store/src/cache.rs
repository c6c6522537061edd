#![forbid(unsafe_code)]

//! Identity map and path cache for wrappers.
//!
//! # Design
//!
//! Two maps back [`WrapperCache::wrap`]:
//!
//! - `by_node`: node address -> wrapper. This is the identity map that makes
//!   wrapping idempotent. The wrapper only holds a `Weak` to its node, and a
//!   `Weak` keeps the allocation (not the value) alive, so an address cannot
//!   be reused by a new node while its entry exists.
//! - `by_path`: full dotted path -> wrapper, a fast path for repeated reads.
//!   A hit is only trusted when the wrapper still points at the node that
//!   currently lives at that path.
//!
//! Entries whose node has been dropped are pruned lazily once the identity
//! map grows past a threshold, and on demand through [`WrapperCache::prune`].
//!
//! # Invariants
//!
//! 1. At most one live wrapper per node.
//! 2. The cache never holds a strong reference to a node.

use std::collections::HashMap;
use std::rc::{Rc, Weak};

use chatstate_core::PropertyPath;

use crate::node::NodeRef;
use crate::store::Shared;
use crate::wrapper::{StateRef, WrapperInner};

#[derive(Debug)]
pub(crate) struct WrapperCache {
    by_node: HashMap<usize, Rc<WrapperInner>>,
    by_path: HashMap<String, Weak<WrapperInner>>,
    prune_threshold: usize,
    next_prune: usize,
}

impl WrapperCache {
    pub(crate) fn new(prune_threshold: usize) -> Self {
        let prune_threshold = prune_threshold.max(1);
        Self {
            by_node: HashMap::new(),
            by_path: HashMap::new(),
            prune_threshold,
            next_prune: prune_threshold,
        }
    }

    /// Return the wrapper for `node` living at `path`, creating it on first use.
    pub(crate) fn wrap(
        &mut self,
        node: &NodeRef,
        path: &PropertyPath,
        store: &Weak<Shared>,
    ) -> StateRef {
        let key = path.to_string();
        if let Some(hit) = self.by_path.get(&key).and_then(Weak::upgrade) {
            if hit.points_at(node) {
                return StateRef::from_inner(hit);
            }
        }

        let addr = Rc::as_ptr(node) as usize;
        let inner = match self.by_node.get(&addr) {
            Some(existing) if existing.points_at(node) => Rc::clone(existing),
            _ => {
                let created = Rc::new(WrapperInner::new(node, path.clone(), store.clone()));
                self.by_node.insert(addr, Rc::clone(&created));
                created
            }
        };
        self.by_path.insert(key, Rc::downgrade(&inner));

        if self.by_node.len() > self.next_prune {
            self.prune();
            self.next_prune = self.prune_threshold.max(self.by_node.len() * 2);
        }

        StateRef::from_inner(inner)
    }

    /// Drop entries whose node no longer exists. Returns how many wrappers
    /// were released.
    pub(crate) fn prune(&mut self) -> usize {
        let before = self.by_node.len();
        self.by_node.retain(|_, wrapper| wrapper.is_live());
        self.by_path
            .retain(|_, weak| weak.upgrade().is_some_and(|wrapper| wrapper.is_live()));
        before - self.by_node.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_node.len()
    }
}
