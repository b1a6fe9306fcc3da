//! The store: shared state, path resolution and the write pipeline.
//!
//! A store owns one object-rooted tree behind a cheaply clonable handle.
//! All mutation funnels through a single pipeline: resolve the parent,
//! screen no-ops, run the interceptor chain, reconcile the subtree,
//! record history, then queue observer notification. Writes cascaded
//! from interceptors or observers nest the pipeline; notifications only
//! flush once the outermost write unwinds.

use crate::history::{HistoryEntry, HistoryFeed, HistoryState};
use crate::interceptors::InterceptorRegistry;
use crate::node::{detached_node, node_to_value, BranchCell, BranchKind, BranchRef, Node};
use crate::observers::{ChangeEntry, InlineScheduler, ObserverRegistry, Origin, Scheduler};
use crate::reconcile::Reconciler;
use serde_json::Value;
use statetree_path::Path;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use thiserror::Error;

/// Maximum pipeline nesting for cascading writes before the write is
/// rejected.
pub const MAX_CASCADE_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("the root container cannot be written directly")]
    RootMutation,
    #[error("the root has no parent")]
    RootParent,
    #[error("a store root must be an object")]
    RootKind,
    #[error("no container to hold {0}")]
    ParentNotFound(Path),
    #[error("array index is not numeric: {0:?}")]
    BadArrayIndex(String),
    #[error("cascading writes exceeded depth {MAX_CASCADE_DEPTH}")]
    CascadeOverflow,
    #[error("path is outside the fragment map: {0}")]
    UnmappedFragmentPath(Path),
    #[error("fragment roots cannot be observed or intercepted directly")]
    FragmentRoot,
    #[error("fragment already dissolved")]
    FragmentDissolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// A user write: interceptors, history and auto-batching apply.
    Pipeline,
    /// History replay: commit and notify only.
    Replay,
}

pub(crate) struct StoreShared {
    pub root: BranchRef,
    pub observers: RefCell<ObserverRegistry>,
    pub interceptors: RefCell<InterceptorRegistry>,
    pub history: RefCell<HistoryState>,
    /// Change sets committed but not yet dispatched.
    pub pending: RefCell<VecDeque<Vec<ChangeEntry>>>,
    /// Deferral stack; see `Store::defer_observers`.
    pub defer: RefCell<Vec<indexmap::IndexMap<Path, ChangeEntry>>>,
    pub write_depth: Cell<usize>,
    pub flushing: Cell<bool>,
    pub next_id: Cell<u64>,
    pub preserve_references: Cell<bool>,
    pub observe_async: Cell<bool>,
    pub scheduler: RefCell<Rc<dyn Scheduler>>,
    /// Path prefixes under which branch identity is not preserved.
    pub augmented: RefCell<Vec<Path>>,
}

/// Handle to a shared store. Clones are cheap and all refer to the same
/// tree; the store is single-threaded by construction (`!Send`).
#[derive(Clone)]
pub struct Store {
    pub(crate) shared: Rc<StoreShared>,
}

impl Store {
    /// Creates a store, optionally seeded from a plain object. The seed
    /// is written through the pipeline with recording suspended, so a
    /// fresh store starts with an empty history.
    pub fn new(initial: Option<Value>) -> Result<Store, StoreError> {
        match &initial {
            None | Some(Value::Object(_)) => {}
            Some(_) => return Err(StoreError::RootKind),
        }
        let shared = Rc::new(StoreShared {
            root: BranchCell::new(BranchKind::Object, Path::root()),
            observers: RefCell::new(ObserverRegistry::default()),
            interceptors: RefCell::new(InterceptorRegistry::default()),
            history: RefCell::new(HistoryState::new(Vec::new(), 0, None)),
            pending: RefCell::new(VecDeque::new()),
            defer: RefCell::new(Vec::new()),
            write_depth: Cell::new(0),
            flushing: Cell::new(false),
            next_id: Cell::new(1),
            preserve_references: Cell::new(true),
            observe_async: Cell::new(false),
            scheduler: RefCell::new(Rc::new(InlineScheduler)),
            augmented: RefCell::new(Vec::new()),
        });
        let store = Store { shared };
        store.load_initial(initial)?;
        Ok(store)
    }

    /// Creates a store with a restored timeline. `cursor` is clamped to
    /// the number of entries; the feed pages older entries in on undo.
    pub fn with_history(
        initial: Option<Value>,
        entries: Vec<HistoryEntry>,
        cursor: usize,
        feed: Option<HistoryFeed>,
    ) -> Result<Store, StoreError> {
        let store = Store::new(initial)?;
        *store.shared.history.borrow_mut() = HistoryState::new(entries, cursor, feed);
        Ok(store)
    }

    fn load_initial(&self, initial: Option<Value>) -> Result<(), StoreError> {
        let Some(Value::Object(map)) = initial else {
            return Ok(());
        };
        self.stop_record();
        let result = map.into_iter().try_for_each(|(key, value)| {
            self.write_internal(&Path::root().key(key), Some(value), WriteMode::Pipeline)
                .map(|_| ())
        });
        self.record();
        result
    }

    /// Writes `value` at `path`, creating or replacing it. Returns
    /// whether anything was committed (`false` for no-ops and vetoed
    /// writes). The parent container must already exist.
    pub fn set(&self, path: &Path, value: Value) -> Result<bool, StoreError> {
        self.write_internal(path, Some(value), WriteMode::Pipeline)
    }

    /// Removes the value at `path`. Deleting an absent path is a no-op.
    pub fn delete(&self, path: &Path) -> Result<bool, StoreError> {
        self.write_internal(path, None, WriteMode::Pipeline)
    }

    /// Deep snapshot of the value at `path`, or `None` when absent.
    pub fn resolve(&self, path: &Path) -> Option<Value> {
        if path.is_root() {
            return Some(self.shared.root.to_value());
        }
        let parent = self.branch_at(&path.parent()?)?;
        parent.get(path.leaf()?).map(|node| node_to_value(&node))
    }

    /// Handle to the container at `path`, or `None` when the path is
    /// absent or holds a leaf.
    pub fn node(&self, path: &Path) -> Option<NodeRef> {
        self.branch_at(path).map(|cell| NodeRef {
            shared: self.shared.clone(),
            cell,
        })
    }

    pub fn root(&self) -> NodeRef {
        NodeRef {
            shared: self.shared.clone(),
            cell: self.shared.root.clone(),
        }
    }

    /// Handle to the container holding `path`.
    pub fn parent_of(&self, path: &Path) -> Result<NodeRef, StoreError> {
        let parent = path.parent().ok_or(StoreError::RootParent)?;
        self.branch_at(&parent)
            .map(|cell| NodeRef {
                shared: self.shared.clone(),
                cell,
            })
            .ok_or_else(|| StoreError::ParentNotFound(path.clone()))
    }

    /// Whether reconciliation keeps container identity across updates.
    /// On by default.
    pub fn preserve_references(&self) -> bool {
        self.shared.preserve_references.get()
    }

    pub fn set_preserve_references(&self, on: bool) {
        self.shared.preserve_references.set(on);
    }

    /// Whether observer delivery is routed through the scheduler instead
    /// of running inline. Dispatch resolution stays synchronous either
    /// way; only callback invocation moves.
    pub fn observe_async(&self) -> bool {
        self.shared.observe_async.get()
    }

    pub fn set_observe_async(&self, on: bool) {
        self.shared.observe_async.set(on);
    }

    pub fn set_scheduler(&self, scheduler: Rc<dyn Scheduler>) {
        *self.shared.scheduler.borrow_mut() = scheduler;
    }

    pub(crate) fn scheduler(&self) -> Rc<dyn Scheduler> {
        self.shared.scheduler.borrow().clone()
    }

    pub(crate) fn write_depth(&self) -> usize {
        self.shared.write_depth.get()
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        id
    }

    /// Marks a subtree as augmented: reconciliation under it always
    /// builds fresh cells.
    pub(crate) fn add_augmented(&self, path: Path) {
        let mut augmented = self.shared.augmented.borrow_mut();
        if !augmented.contains(&path) {
            augmented.push(path);
        }
    }

    pub(crate) fn is_augmented(&self, path: &Path) -> bool {
        self.shared
            .augmented
            .borrow()
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }

    /// Walks container cells from the root along `path`.
    pub(crate) fn branch_at(&self, path: &Path) -> Option<BranchRef> {
        let mut branch = self.shared.root.clone();
        for token in path.tokens() {
            match branch.get(token)? {
                Node::Branch(next) => branch = next,
                Node::Leaf(_) => return None,
            }
        }
        Some(branch)
    }

    /// The write pipeline. `Ok(false)` means nothing was committed.
    pub(crate) fn write_internal(
        &self,
        path: &Path,
        value: Option<Value>,
        mode: WriteMode,
    ) -> Result<bool, StoreError> {
        let (Some(parent_path), Some(key)) = (path.parent(), path.leaf().map(str::to_string))
        else {
            return Err(StoreError::RootMutation);
        };
        let parent = self
            .branch_at(&parent_path)
            .ok_or_else(|| StoreError::ParentNotFound(path.clone()))?;
        if parent.kind() == BranchKind::Array && key.parse::<usize>().is_err() {
            return Err(StoreError::BadArrayIndex(key));
        }
        let old_node = parent.get(&key);
        let old_snapshot = old_node.as_ref().map(node_to_value);
        if value == old_snapshot {
            return Ok(false);
        }

        let depth = self.shared.write_depth.get();
        if depth >= MAX_CASCADE_DEPTH {
            return Err(StoreError::CascadeOverflow);
        }
        self.shared.write_depth.set(depth + 1);
        // a cascade's writes fold into one history entry
        if depth + 1 == 2 && mode == WriteMode::Pipeline {
            self.auto_batch_open();
        }

        let committed = self.run_pipeline(path, &parent_path, &key, value, old_node, old_snapshot, mode);

        let depth = self.shared.write_depth.get() - 1;
        self.shared.write_depth.set(depth);
        if depth == 0 {
            self.auto_batch_close();
            self.flush_pending();
        }
        Ok(committed)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_pipeline(
        &self,
        path: &Path,
        parent_path: &Path,
        key: &str,
        value: Option<Value>,
        mut old_node: Option<Node>,
        mut old_snapshot: Option<Value>,
        mode: WriteMode,
    ) -> bool {
        let mut candidate = value;
        if mode == WriteMode::Pipeline {
            let (next, vetoed) =
                self.dispatch_interceptors(path, &old_snapshot, path, &old_snapshot, candidate, true);
            if vetoed {
                return false;
            }
            candidate = next;
            // cascading writes from the chain may have restructured the
            // tree under us
            let Some(parent) = self.branch_at(parent_path) else {
                log::warn!(
                    target: "statetree::store",
                    "write at {path} dropped: parent container vanished during interception"
                );
                return false;
            };
            old_node = parent.get(key);
            old_snapshot = old_node.as_ref().map(node_to_value);
            if candidate == old_snapshot {
                return false;
            }
        }

        let Some(parent) = self.branch_at(parent_path) else {
            log::warn!(
                target: "statetree::store",
                "write at {path} dropped: parent container vanished"
            );
            return false;
        };
        let origin = Rc::new(Origin {
            path: path.clone(),
            old: old_snapshot.clone(),
        });
        let mut reconciler = Reconciler::new(self, origin.clone(), mode);
        let node = reconciler.reconcile(candidate, old_node, path);
        if reconciler.changes == 0 {
            return false;
        }
        match node {
            Some(node) => parent.insert(key.to_string(), node),
            None => parent.remove(key),
        }
        if mode == WriteMode::Pipeline {
            self.log_write(path, &old_snapshot);
        }
        let mut entries = reconciler.into_entries();
        entries.push(ChangeEntry {
            path: path.clone(),
            old: old_snapshot,
            bubble: true,
            origin,
        });
        self.enqueue_change_set(entries);
        true
    }
}

/// Handle to a live (or dead) container cell.
///
/// A connected handle routes writes through the owning store's pipeline.
/// Once the container is replaced or deleted the handle goes
/// disconnected: reads keep serving the final data and writes mutate
/// only the dead copy, with no interceptors, history or notifications.
#[derive(Clone)]
pub struct NodeRef {
    shared: Rc<StoreShared>,
    cell: BranchRef,
}

impl NodeRef {
    fn store(&self) -> Store {
        Store {
            shared: self.shared.clone(),
        }
    }

    pub fn path(&self) -> Path {
        self.cell.path()
    }

    pub fn kind(&self) -> BranchKind {
        self.cell.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.cell.is_connected()
    }

    pub fn to_value(&self) -> Value {
        self.cell.to_value()
    }

    /// Deep snapshot of one child, or `None` when absent.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.cell.get(key).map(|node| node_to_value(&node))
    }

    /// Handle to a child container.
    pub fn child(&self, key: &str) -> Option<NodeRef> {
        match self.cell.get(key)? {
            Node::Branch(cell) => Some(NodeRef {
                shared: self.shared.clone(),
                cell,
            }),
            Node::Leaf(_) => None,
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.cell.keys()
    }

    pub fn len(&self) -> usize {
        self.cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell.is_empty()
    }

    pub fn set(&self, key: &str, value: Value) -> Result<bool, StoreError> {
        if !self.cell.is_connected() {
            let path = self.cell.path().child(key);
            self.cell.insert(key.to_string(), detached_node(value, &path));
            return Ok(true);
        }
        self.store()
            .write_internal(&self.cell.path().child(key), Some(value), WriteMode::Pipeline)
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        if !self.cell.is_connected() {
            let had = self.cell.contains_key(key);
            self.cell.remove(key);
            return Ok(had);
        }
        self.store()
            .write_internal(&self.cell.path().child(key), None, WriteMode::Pipeline)
    }
}
