//! Registration trie shared by the observer and interceptor registries.
//!
//! Ids live in per-path leaves, split by scope. Scopes are cumulative:
//! every registration lands in `exact`; child-scope registrations also
//! land in `children`; deep-scope registrations land in all three.

use statetree_path::Path;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct MetaTree {
    root: MetaNode,
}

#[derive(Debug, Default)]
struct MetaNode {
    children: HashMap<String, MetaNode>,
    leaf: Option<MetaLeaf>,
}

#[derive(Debug, Default)]
pub(crate) struct MetaLeaf {
    pub exact: Vec<u64>,
    pub children: Vec<u64>,
    pub deep: Vec<u64>,
}

impl MetaLeaf {
    fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.children.is_empty() && self.deep.is_empty()
    }

    fn remove(&mut self, id: u64) {
        self.exact.retain(|x| *x != id);
        self.children.retain(|x| *x != id);
        self.deep.retain(|x| *x != id);
    }
}

impl MetaTree {
    pub fn register(&mut self, path: &Path, id: u64, children_scope: bool, deep_scope: bool) {
        let mut node = &mut self.root;
        for token in path.tokens() {
            node = node.children.entry(token.clone()).or_default();
        }
        let leaf = node.leaf.get_or_insert_with(MetaLeaf::default);
        leaf.exact.push(id);
        if children_scope || deep_scope {
            leaf.children.push(id);
        }
        if deep_scope {
            leaf.deep.push(id);
        }
    }

    /// Drops `id` at `path` and prunes branches left empty.
    pub fn unregister(&mut self, path: &Path, id: u64) {
        fn walk(node: &mut MetaNode, tokens: &[String], id: u64) -> bool {
            match tokens.split_first() {
                None => {
                    if let Some(leaf) = &mut node.leaf {
                        leaf.remove(id);
                        if leaf.is_empty() {
                            node.leaf = None;
                        }
                    }
                }
                Some((head, rest)) => {
                    if let Some(child) = node.children.get_mut(head) {
                        if walk(child, rest, id) {
                            node.children.remove(head);
                        }
                    }
                }
            }
            node.leaf.is_none() && node.children.is_empty()
        }
        walk(&mut self.root, path.tokens(), id);
    }

    fn leaf(&self, path: &Path) -> Option<&MetaLeaf> {
        let mut node = &self.root;
        for token in path.tokens() {
            node = node.children.get(token)?;
        }
        node.leaf.as_ref()
    }

    pub fn exact_at(&self, path: &Path) -> Vec<u64> {
        self.leaf(path).map(|l| l.exact.clone()).unwrap_or_default()
    }

    pub fn children_at(&self, path: &Path) -> Vec<u64> {
        self.leaf(path)
            .map(|l| l.children.clone())
            .unwrap_or_default()
    }

    pub fn deep_at(&self, path: &Path) -> Vec<u64> {
        self.leaf(path).map(|l| l.deep.clone()).unwrap_or_default()
    }

    pub fn has_exact(&self, path: &Path) -> bool {
        self.leaf(path).is_some_and(|l| !l.exact.is_empty())
    }
}
