//! The store tree: tagged nodes and shared branch cells.
//!
//! A node is either a scalar leaf or a branch (object/array container).
//! Branches are reference-counted cells so that handles captured by
//! callers keep observing the live data while reconciliation preserves
//! container identity across structurally-compatible updates.

use indexmap::IndexMap;
use serde_json::Value;
use statetree_path::Path;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Object,
    Array,
}

impl BranchKind {
    pub fn of(value: &Value) -> Option<BranchKind> {
        match value {
            Value::Object(_) => Some(BranchKind::Object),
            Value::Array(_) => Some(BranchKind::Array),
            _ => None,
        }
    }
}

/// One value in the tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// A scalar (`null`, bool, number, string).
    Leaf(Value),
    Branch(BranchRef),
}

pub type BranchRef = Rc<BranchCell>;

/// A shared container cell. Arrays are stored as the same ordered map as
/// objects, keyed by decimal index tokens; the array length is derived
/// from the highest surviving index, which makes trailing-hole trimming
/// implicit.
#[derive(Debug)]
pub struct BranchCell {
    inner: RefCell<BranchData>,
}

#[derive(Debug)]
struct BranchData {
    kind: BranchKind,
    entries: IndexMap<String, Node>,
    path: Path,
    connected: bool,
}

impl BranchCell {
    pub fn new(kind: BranchKind, path: Path) -> BranchRef {
        Rc::new(BranchCell {
            inner: RefCell::new(BranchData {
                kind,
                entries: IndexMap::new(),
                path,
                connected: true,
            }),
        })
    }

    pub fn kind(&self) -> BranchKind {
        self.inner.borrow().kind
    }

    /// The canonical path this branch remembers for itself.
    pub fn path(&self) -> Path {
        self.inner.borrow().path.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    /// Marks the cell as a dead, inert copy. Writes through retained
    /// handles then bypass the pipeline entirely.
    pub fn disconnect(&self) {
        self.inner.borrow_mut().connected = false;
    }

    pub fn get(&self, key: &str) -> Option<Node> {
        self.inner.borrow().entries.get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.borrow().entries.contains_key(key)
    }

    pub fn insert(&self, key: String, node: Node) {
        self.inner.borrow_mut().entries.insert(key, node);
    }

    pub fn remove(&self, key: &str) {
        self.inner.borrow_mut().entries.shift_remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.borrow().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Deep snapshot as a plain value. Array holes come back as `null`.
    pub fn to_value(&self) -> Value {
        let data = self.inner.borrow();
        match data.kind {
            BranchKind::Object => {
                let mut map = serde_json::Map::with_capacity(data.entries.len());
                for (key, node) in &data.entries {
                    map.insert(key.clone(), node_to_value(node));
                }
                Value::Object(map)
            }
            BranchKind::Array => {
                let len = data
                    .entries
                    .keys()
                    .filter_map(|k| k.parse::<usize>().ok())
                    .map(|i| i + 1)
                    .max()
                    .unwrap_or(0);
                let mut items = vec![Value::Null; len];
                for (key, node) in &data.entries {
                    if let Ok(index) = key.parse::<usize>() {
                        items[index] = node_to_value(node);
                    }
                }
                Value::Array(items)
            }
        }
    }
}

pub fn node_to_value(node: &Node) -> Value {
    match node {
        Node::Leaf(value) => value.clone(),
        Node::Branch(branch) => branch.to_value(),
    }
}

/// Builds a detached subtree from a plain value, outside the pipeline.
/// Used for writes through disconnected handles, which mutate only the
/// dead copy.
pub fn detached_node(value: Value, path: &Path) -> Node {
    match value {
        Value::Object(map) => {
            let branch = BranchCell::new(BranchKind::Object, path.clone());
            branch.disconnect();
            for (key, child) in map {
                let node = detached_node(child, &path.child(&key));
                branch.insert(key, node);
            }
            Node::Branch(branch)
        }
        Value::Array(items) => {
            let branch = BranchCell::new(BranchKind::Array, path.clone());
            branch.disconnect();
            for (index, child) in items.into_iter().enumerate() {
                let key = index.to_string();
                let node = detached_node(child, &path.child(&key));
                branch.insert(key, node);
            }
            Node::Branch(branch)
        }
        scalar => Node::Leaf(scalar),
    }
}
