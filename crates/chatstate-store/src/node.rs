#![forbid(unsafe_code)]

//! Storage nodes of the state tree.
//!
//! Object-shaped values become [`ObjectNode`]s behind `Rc<RefCell<..>>` so a
//! node has a stable identity for the wrapper cache. Everything else
//! (scalars, `null`, arrays) is an opaque [`Node::Leaf`]; arrays are never
//! split into nodes even when they contain objects.
//!
//! A parent is the only strong owner of its children. Wrappers and caches
//! hold `Weak` references, so replacing a subtree frees it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use chatstate_core::{Map, Value};

pub(crate) type NodeRef = Rc<RefCell<ObjectNode>>;

#[derive(Debug, Clone)]
pub(crate) enum Node {
    /// Any non-object value. Never holds `Value::Object`.
    Leaf(Value),
    Object(NodeRef),
}

impl Node {
    /// Convert an owned value into a node, splitting objects recursively.
    pub(crate) fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Object(Rc::new(RefCell::new(ObjectNode::from_map(map)))),
            other => Self::Leaf(other),
        }
    }

    /// Snapshot this node as a plain value.
    pub(crate) fn to_value(&self) -> Value {
        match self {
            Self::Leaf(value) => value.clone(),
            Self::Object(node) => node.borrow().to_value(),
        }
    }

    pub(crate) fn is_null(&self) -> bool {
        matches!(self, Self::Leaf(Value::Null))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ObjectNode {
    entries: BTreeMap<String, Node>,
}

impl ObjectNode {
    pub(crate) fn new_ref() -> NodeRef {
        Rc::new(RefCell::new(Self::default()))
    }

    pub(crate) fn from_map(map: Map<String, Value>) -> Self {
        Self {
            entries: map
                .into_iter()
                .map(|(key, value)| (key, Node::from_value(value)))
                .collect(),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Node> {
        self.entries.get(key)
    }

    pub(crate) fn insert(&mut self, key: String, node: Node) -> Option<Node> {
        self.entries.insert(key, node)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Node> {
        self.entries.remove(key)
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(key, node)| (key.clone(), node.to_value()))
                .collect(),
        )
    }
}

/// Walk `segments` from `root`, returning the node found there.
pub(crate) fn lookup(root: &NodeRef, segments: &[String]) -> Option<Node> {
    let mut current = Node::Object(Rc::clone(root));
    for segment in segments {
        let next = match &current {
            Node::Object(node) => node.borrow().get(segment).cloned()?,
            Node::Leaf(_) => return None,
        };
        current = next;
    }
    Some(current)
}
