//! Recursive tree reconciliation.
//!
//! Reconciliation walks an incoming plain value against the live node it
//! replaces, mutating the tree key by key instead of swapping subtrees
//! wholesale. Container cells whose kind survives the update keep their
//! identity (unless reference preservation is off or the subtree is
//! augmented), so branch handles held by callers stay live. Replaced and
//! deleted branches are disconnected and left as dead copies with their
//! data intact.

use crate::node::{node_to_value, BranchCell, BranchKind, BranchRef, Node};
use crate::observers::{ChangeEntry, Origin};
use crate::store::{Store, WriteMode};
use serde_json::Value;
use statetree_path::Path;
use std::rc::Rc;

pub(crate) struct Reconciler<'a> {
    store: &'a Store,
    origin: Rc<Origin>,
    mode: WriteMode,
    preserve: bool,
    /// Count of committed differences; zero means the write was a no-op.
    pub changes: usize,
    entries: Vec<ChangeEntry>,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, origin: Rc<Origin>, mode: WriteMode) -> Self {
        Reconciler {
            store,
            origin,
            mode,
            preserve: store.preserve_references(),
            changes: 0,
            entries: Vec::new(),
        }
    }

    /// Nested change entries collected during the walk, deepest first.
    pub fn into_entries(self) -> Vec<ChangeEntry> {
        self.entries
    }

    /// Reconciles one value slot. Returns the node to place at `path`,
    /// or `None` for a deletion.
    pub fn reconcile(&mut self, new: Option<Value>, old: Option<Node>, path: &Path) -> Option<Node> {
        match new {
            Some(value) => match BranchKind::of(&value) {
                Some(kind) => Some(self.reconcile_container(kind, value, old, path)),
                None => self.reconcile_leaf(Some(value), old, path),
            },
            None => self.reconcile_leaf(None, old, path),
        }
    }

    fn reconcile_leaf(
        &mut self,
        new: Option<Value>,
        old: Option<Node>,
        path: &Path,
    ) -> Option<Node> {
        if let Some(Node::Branch(branch)) = &old {
            // container -> leaf/absent: every nested key goes away
            self.flush_branch(branch, path);
            branch.disconnect();
            self.changes += 1;
            return new.map(Node::Leaf);
        }
        let old_value = match &old {
            Some(Node::Leaf(value)) => Some(value),
            _ => None,
        };
        if old_value == new.as_ref() {
            return old;
        }
        self.changes += 1;
        new.map(Node::Leaf)
    }

    fn reconcile_container(
        &mut self,
        kind: BranchKind,
        value: Value,
        old: Option<Node>,
        path: &Path,
    ) -> Node {
        let old_branch = match &old {
            Some(Node::Branch(branch)) => Some(branch.clone()),
            _ => None,
        };
        let reuse = self.preserve
            && !self.store.is_augmented(path)
            && old_branch
                .as_ref()
                .is_some_and(|b| b.kind() == kind && b.is_connected());
        let target = match (&old_branch, reuse) {
            (Some(branch), true) => branch.clone(),
            _ => {
                // fresh cell: identity breaks, which is itself a change
                self.changes += 1;
                BranchCell::new(kind, path.clone())
            }
        };

        let mut keys: Vec<String> = old_branch.as_ref().map(|b| b.keys()).unwrap_or_default();
        for key in container_keys(&value) {
            if !keys.iter().any(|k| *k == key) {
                keys.push(key);
            }
        }
        for key in keys {
            let child_path = path.child(&key);
            let new_child = container_get(&value, &key);
            let old_child = old_branch.as_ref().and_then(|b| b.get(&key));
            self.reconcile_key(&target, reuse, &key, new_child, old_child, &child_path);
        }

        if let Some(branch) = &old_branch {
            if !reuse {
                branch.disconnect();
            }
        }
        Node::Branch(target)
    }

    /// Diffs one key of a container. `mutate_old` is true when `target`
    /// is the reused live branch; otherwise unchanged children are
    /// carried across into the fresh cell.
    fn reconcile_key(
        &mut self,
        target: &BranchRef,
        mutate_old: bool,
        key: &str,
        mut new_child: Option<Value>,
        old_child: Option<Node>,
        child_path: &Path,
    ) {
        let old_snapshot = old_child.as_ref().map(node_to_value);
        if new_child == old_snapshot {
            if !mutate_old {
                if let Some(node) = old_child {
                    target.insert(key.to_string(), node);
                }
            }
            return;
        }

        if self.mode == WriteMode::Pipeline && self.store.has_exact_interceptors(child_path) {
            let (next, vetoed) = self.store.dispatch_interceptors(
                child_path,
                &old_snapshot,
                &self.origin.path,
                &self.origin.old,
                new_child,
                false,
            );
            if vetoed || next == old_snapshot {
                if !mutate_old {
                    if let Some(node) = old_child {
                        target.insert(key.to_string(), node);
                    }
                }
                return;
            }
            new_child = next;
        }

        match self.reconcile(new_child, old_child, child_path) {
            Some(node) => target.insert(key.to_string(), node),
            None => {
                if mutate_old {
                    target.remove(key);
                }
            }
        }
        self.push_entry(child_path, old_snapshot);
    }

    /// Records the recursive teardown of a dying branch without touching
    /// its entries; the dead copy keeps its data for retained handles.
    ///
    /// Exact interceptors see each nested deletion just as they would in
    /// a union pass. A veto keeps that key out of the change set; a
    /// transformed candidate has nowhere to land once the container is
    /// gone and is not honored.
    fn flush_branch(&mut self, branch: &BranchRef, path: &Path) {
        for key in branch.keys() {
            let child_path = path.child(&key);
            let old_child = branch.get(&key);
            let old_snapshot = old_child.as_ref().map(node_to_value);
            if self.mode == WriteMode::Pipeline && self.store.has_exact_interceptors(&child_path)
            {
                let (_, vetoed) = self.store.dispatch_interceptors(
                    &child_path,
                    &old_snapshot,
                    &self.origin.path,
                    &self.origin.old,
                    None,
                    false,
                );
                if vetoed {
                    // the subtree still leaves the live tree; only the
                    // deletion notification is suppressed
                    if let Some(Node::Branch(child)) = &old_child {
                        disconnect_subtree(child);
                    }
                    continue;
                }
            }
            if let Some(Node::Branch(child)) = &old_child {
                self.flush_branch(child, &child_path);
                child.disconnect();
            }
            self.changes += 1;
            self.push_entry(&child_path, old_snapshot);
        }
    }

    /// Nested entries only matter to observers registered exactly there;
    /// skip the allocation otherwise.
    fn push_entry(&mut self, path: &Path, old: Option<Value>) {
        if !self.store.has_exact_observers(path) {
            return;
        }
        self.entries.push(ChangeEntry {
            path: path.clone(),
            old,
            bubble: false,
            origin: self.origin.clone(),
        });
    }
}

fn disconnect_subtree(branch: &BranchRef) {
    for key in branch.keys() {
        if let Some(Node::Branch(child)) = branch.get(&key) {
            disconnect_subtree(&child);
        }
    }
    branch.disconnect();
}

fn container_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        Value::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
        _ => Vec::new(),
    }
}

fn container_get(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(map) => map.get(key).cloned(),
        Value::Array(items) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index).cloned()),
        _ => None,
    }
}
