//! Post-commit observer dispatch.
//!
//! Observers register against a path with one of three scopes (exact,
//! children, deep descendants) and are notified after a commit, at most
//! once per commit each. Notification sets can be deferred into a
//! nestable buffer stack, and delivery can be routed through an
//! injectable scheduler instead of running inline.

use crate::meta::MetaTree;
use crate::store::Store;
use serde_json::Value;
use statetree_path::Path;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use indexmap::IndexMap;

/// One delivered notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Path of the changed value.
    pub path: Path,
    /// Value at `path` before the change; `None` when it was absent.
    pub old: Option<Value>,
    /// Top-level mutated path of the commit this change belongs to.
    pub origin_path: Path,
    /// Value at `origin_path` before the commit.
    pub origin_old: Option<Value>,
}

pub type ObserverFn = Rc<dyn Fn(&ChangeEvent)>;

/// Deferred-delivery seam. The default `InlineScheduler` runs tasks
/// synchronously; tests and embedders can swap in `QueueScheduler` or
/// their own event-loop adapter.
pub trait Scheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>);
}

pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>) {
        task();
    }
}

/// Collects tasks for manual draining.
#[derive(Default)]
pub struct QueueScheduler {
    tasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl QueueScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Runs every queued task, including ones queued while draining.
    pub fn run(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Scheduler for QueueScheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>) {
        self.tasks.borrow_mut().push_back(task);
    }
}

/// The top-level write a change set belongs to, shared by its entries.
#[derive(Debug)]
pub(crate) struct Origin {
    pub path: Path,
    pub old: Option<Value>,
}

/// One line of a commit's change set.
#[derive(Debug, Clone)]
pub(crate) struct ChangeEntry {
    pub path: Path,
    pub old: Option<Value>,
    /// Only the top-level mutated path bubbles to children/deep scopes;
    /// nested leaf entries are prop-only.
    pub bubble: bool,
    pub origin: Rc<Origin>,
}

impl ChangeEntry {
    fn to_event(&self) -> ChangeEvent {
        ChangeEvent {
            path: self.path.clone(),
            old: self.old.clone(),
            origin_path: self.origin.path.clone(),
            origin_old: self.origin.old.clone(),
        }
    }
}

struct ObserverItem {
    path: Path,
    callback: ObserverFn,
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    tree: MetaTree,
    items: HashMap<u64, ObserverItem>,
}

impl ObserverRegistry {
    fn callback(&self, id: u64) -> Option<ObserverFn> {
        self.items.get(&id).map(|item| item.callback.clone())
    }
}

impl Store {
    /// Registers an observer on `path`. `children` widens the scope to
    /// direct children, `deep` to all descendants. With `init` the
    /// callback fires once immediately with `old = None`.
    ///
    /// Callback panics are not isolated: a panicking observer unwinds
    /// through the notification pass and later observers are skipped.
    pub fn observe(
        &self,
        path: &Path,
        callback: impl Fn(&ChangeEvent) + 'static,
        children: bool,
        deep: bool,
        init: bool,
    ) -> u64 {
        let id = self.next_id();
        let callback: ObserverFn = Rc::new(callback);
        {
            let mut reg = self.shared.observers.borrow_mut();
            reg.tree.register(path, id, children, deep);
            reg.items.insert(
                id,
                ObserverItem {
                    path: path.clone(),
                    callback: callback.clone(),
                },
            );
        }
        if init {
            let event = ChangeEvent {
                path: path.clone(),
                old: None,
                origin_path: path.clone(),
                origin_old: None,
            };
            self.deliver(vec![(id, event)]);
        }
        id
    }

    pub fn stop_observe(&self, id: u64) -> bool {
        let mut reg = self.shared.observers.borrow_mut();
        match reg.items.remove(&id) {
            Some(item) => {
                reg.tree.unregister(&item.path, id);
                true
            }
            None => false,
        }
    }

    /// Pushes one level onto the deferral stack. While the stack is
    /// non-empty, commit notifications buffer and coalesce per path
    /// instead of firing.
    pub fn defer_observers(&self) {
        self.shared.defer.borrow_mut().push(IndexMap::new());
    }

    /// Pops one deferral level and flushes its buffer (`all` pops and
    /// flushes every level, innermost first).
    pub fn resume_observers(&self, all: bool) {
        loop {
            let level = self.shared.defer.borrow_mut().pop();
            let Some(level) = level else { break };
            let set: Vec<ChangeEntry> = level.into_values().collect();
            if !set.is_empty() {
                let fired = self.dispatch_set(&set);
                self.deliver_via_scheduler(fired);
            }
            if !all {
                break;
            }
        }
        self.maybe_schedule_prune();
    }

    /// Re-fires observers for `path` as if it had just been committed,
    /// with no actual change (`old` is the current value).
    pub fn refresh(&self, path: &Path) {
        let current = self.resolve(path);
        let origin = Rc::new(Origin {
            path: path.clone(),
            old: current.clone(),
        });
        self.enqueue_change_set(vec![ChangeEntry {
            path: path.clone(),
            old: current,
            bubble: true,
            origin,
        }]);
    }

    pub(crate) fn has_exact_observers(&self, path: &Path) -> bool {
        self.shared.observers.borrow().tree.has_exact(path)
    }

    /// Routes one commit's change set to the deferral stack or the
    /// pending flush queue.
    ///
    /// While deferred, entries coalesce per path: a path already
    /// buffered anywhere in the stack keeps its oldest pre-change value
    /// and migrates to the innermost level.
    pub(crate) fn enqueue_change_set(&self, set: Vec<ChangeEntry>) {
        {
            let mut stack = self.shared.defer.borrow_mut();
            if let Some(innermost) = stack.len().checked_sub(1) {
                for entry in set {
                    let mut merged = entry;
                    for level in stack.iter_mut() {
                        if let Some(prior) = level.shift_remove(&merged.path) {
                            merged = ChangeEntry {
                                path: prior.path,
                                old: prior.old,
                                bubble: prior.bubble || merged.bubble,
                                origin: prior.origin,
                            };
                            break;
                        }
                    }
                    stack[innermost].insert(merged.path.clone(), merged);
                }
                return;
            }
        }
        self.shared.pending.borrow_mut().push_back(set);
        if self.write_depth() == 0 {
            self.flush_pending();
        }
    }

    /// Flushes queued change sets, one dispatch pass per commit.
    pub(crate) fn flush_pending(&self) {
        if self.shared.flushing.get() {
            return;
        }
        self.shared.flushing.set(true);
        loop {
            let set = self.shared.pending.borrow_mut().pop_front();
            let Some(set) = set else { break };
            let fired = self.dispatch_set(&set);
            self.deliver_via_scheduler(fired);
        }
        self.shared.flushing.set(false);
        self.maybe_schedule_prune();
    }

    /// Matches one change set against the registry. Each observer id is
    /// collected at most once, in change-set order: exact scope per
    /// entry; for the bubbling entry also children scope on its parent,
    /// then deep scope on strict ancestors nearest-first.
    fn dispatch_set(&self, set: &[ChangeEntry]) -> Vec<(u64, ChangeEvent)> {
        let reg = self.shared.observers.borrow();
        let mut fired: Vec<(u64, ChangeEvent)> = Vec::new();
        let mut seen: HashSet<u64> = HashSet::new();
        for entry in set {
            for id in reg.tree.exact_at(&entry.path) {
                if seen.insert(id) {
                    fired.push((id, entry.to_event()));
                }
            }
            if !entry.bubble {
                continue;
            }
            let prefixes = entry.path.strict_prefixes();
            if let Some((parent, ancestors)) = prefixes.split_last() {
                for id in reg.tree.children_at(parent) {
                    if seen.insert(id) {
                        fired.push((id, entry.to_event()));
                    }
                }
                // children scope already covered the parent level
                for ancestor in ancestors.iter().rev() {
                    for id in reg.tree.deep_at(ancestor) {
                        if seen.insert(id) {
                            fired.push((id, entry.to_event()));
                        }
                    }
                }
            }
        }
        fired
    }

    fn deliver_via_scheduler(&self, fired: Vec<(u64, ChangeEvent)>) {
        if fired.is_empty() {
            return;
        }
        if self.observe_async() {
            let store = self.clone();
            let scheduler = self.scheduler();
            scheduler.schedule(Box::new(move || store.deliver(fired)));
        } else {
            self.deliver(fired);
        }
    }

    /// Invokes callbacks in dispatch order, re-resolving each id so that
    /// observers stopped earlier in the same pass are skipped.
    pub(crate) fn deliver(&self, fired: Vec<(u64, ChangeEvent)>) {
        for (id, event) in fired {
            let callback = self.shared.observers.borrow().callback(id);
            match callback {
                Some(callback) => callback(&event),
                None => {
                    log::trace!(
                        target: "statetree::observers",
                        "observer {id} stopped before delivery of {}", event.path
                    );
                }
            }
        }
    }
}
