//! Fragments: relative views over a set of mapped subtrees.
//!
//! A fragment maps local top-level tokens onto absolute store paths and
//! translates between the two coordinate systems, so a component can
//! observe, intercept and write its slice of the tree without knowing
//! where that slice lives. Dissolving a fragment detaches everything it
//! registered; a fragment can also watch a path and dissolve itself when
//! that path disappears.

use crate::interceptors::InterceptCtx;
use crate::observers::ChangeEvent;
use crate::store::{Store, StoreError};
use indexmap::IndexMap;
use serde_json::Value;
use statetree_path::Path;
use std::cell::RefCell;
use std::rc::Rc;

struct FragmentInner {
    store: Store,
    /// Local top-level token -> absolute path of the mapped subtree.
    map: IndexMap<String, Path>,
    observers: Vec<u64>,
    interceptors: Vec<u64>,
    dissolve_watch: Option<u64>,
    dissolved: bool,
    augmented: bool,
}

#[derive(Clone)]
pub struct Fragment {
    inner: Rc<RefCell<FragmentInner>>,
}

fn relative_of(map: &IndexMap<String, Path>, absolute: &Path) -> Option<Path> {
    for (token, base) in map {
        if let Some(rest) = absolute.strip_prefix(base) {
            return Some(Path::root().key(token.clone()).join(&rest));
        }
    }
    None
}

impl Store {
    /// Builds a fragment over this store. With `dissolve_path` the
    /// fragment watches that path and dissolves itself once the path
    /// goes absent.
    pub fn fragment(
        &self,
        map: impl IntoIterator<Item = (String, Path)>,
        dissolve_path: Option<&Path>,
    ) -> Fragment {
        let fragment = Fragment {
            inner: Rc::new(RefCell::new(FragmentInner {
                store: self.clone(),
                map: map.into_iter().collect(),
                observers: Vec::new(),
                interceptors: Vec::new(),
                dissolve_watch: None,
                dissolved: false,
                augmented: false,
            })),
        };
        if let Some(path) = dissolve_path {
            let weak = Rc::downgrade(&fragment.inner);
            let store = self.clone();
            let watched = path.clone();
            let id = self.observe(
                path,
                move |_event| {
                    if store.resolve(&watched).is_none() {
                        if let Some(inner) = weak.upgrade() {
                            Fragment { inner }.dissolve();
                        }
                    }
                },
                false,
                false,
                false,
            );
            fragment.inner.borrow_mut().dissolve_watch = Some(id);
        }
        fragment
    }
}

impl Fragment {
    /// Translates a fragment-relative path into store coordinates. The
    /// first token selects the mapping; the fragment root itself has no
    /// absolute equivalent.
    pub fn absolute_path(&self, relative: &Path) -> Result<Path, StoreError> {
        let inner = self.inner.borrow();
        let first = relative.tokens().first().ok_or(StoreError::FragmentRoot)?;
        let base = inner
            .map
            .get(first)
            .ok_or_else(|| StoreError::UnmappedFragmentPath(relative.clone()))?;
        let rest: Path = relative.tokens()[1..].to_vec().into();
        Ok(base.join(&rest))
    }

    /// Translates an absolute path back into fragment coordinates, or
    /// `None` when it falls outside every mapped subtree.
    pub fn relative_path(&self, absolute: &Path) -> Option<Path> {
        relative_of(&self.inner.borrow().map, absolute)
    }

    /// The mappings, in declaration order.
    pub fn mappings(&self) -> Vec<(String, Path)> {
        self.inner
            .borrow()
            .map
            .iter()
            .map(|(token, base)| (token.clone(), base.clone()))
            .collect()
    }

    pub fn get(&self, relative: &Path) -> Result<Option<Value>, StoreError> {
        let (store, absolute) = self.target(relative)?;
        Ok(store.resolve(&absolute))
    }

    pub fn set(&self, relative: &Path, value: Value) -> Result<bool, StoreError> {
        let (store, absolute) = self.target(relative)?;
        store.set(&absolute, value)
    }

    pub fn delete(&self, relative: &Path) -> Result<bool, StoreError> {
        let (store, absolute) = self.target(relative)?;
        store.delete(&absolute)
    }

    /// Observes a fragment-relative path. Event paths are translated
    /// back into fragment coordinates before the callback sees them.
    pub fn observe(
        &self,
        relative: &Path,
        callback: impl Fn(&ChangeEvent) + 'static,
        children: bool,
        deep: bool,
        init: bool,
    ) -> Result<u64, StoreError> {
        let (store, absolute) = self.target(relative)?;
        let weak = Rc::downgrade(&self.inner);
        let id = store.observe(
            &absolute,
            move |event| {
                let Some(inner) = weak.upgrade() else { return };
                let translated = {
                    let inner = inner.borrow();
                    ChangeEvent {
                        path: relative_of(&inner.map, &event.path)
                            .unwrap_or_else(|| event.path.clone()),
                        old: event.old.clone(),
                        origin_path: relative_of(&inner.map, &event.origin_path)
                            .unwrap_or_else(|| event.origin_path.clone()),
                        origin_old: event.origin_old.clone(),
                    }
                };
                callback(&translated);
            },
            children,
            deep,
            init,
        );
        self.inner.borrow_mut().observers.push(id);
        Ok(id)
    }

    pub fn stop_observe(&self, id: u64) -> bool {
        let store = {
            let mut inner = self.inner.borrow_mut();
            let Some(at) = inner.observers.iter().position(|x| *x == id) else {
                return false;
            };
            inner.observers.remove(at);
            inner.store.clone()
        };
        store.stop_observe(id)
    }

    /// Intercepts writes under a fragment-relative path. Context paths
    /// are translated into fragment coordinates.
    pub fn intercept(
        &self,
        relative: &Path,
        callback: impl Fn(&InterceptCtx<'_>, Option<Value>) -> Option<Value> + 'static,
        children: bool,
        deep: bool,
    ) -> Result<u64, StoreError> {
        let (store, absolute) = self.target(relative)?;
        let weak = Rc::downgrade(&self.inner);
        let id = store.intercept(
            &absolute,
            move |ctx, candidate| {
                let Some(inner) = weak.upgrade() else {
                    return candidate;
                };
                let (path, origin_path) = {
                    let inner = inner.borrow();
                    (
                        relative_of(&inner.map, ctx.path).unwrap_or_else(|| ctx.path.clone()),
                        relative_of(&inner.map, ctx.origin_path)
                            .unwrap_or_else(|| ctx.origin_path.clone()),
                    )
                };
                let translated = InterceptCtx {
                    store: ctx.store,
                    path: &path,
                    old: ctx.old,
                    origin_path: &origin_path,
                    origin_old: ctx.origin_old,
                };
                callback(&translated, candidate)
            },
            children,
            deep,
        );
        self.inner.borrow_mut().interceptors.push(id);
        Ok(id)
    }

    pub fn stop_intercept(&self, id: u64) -> bool {
        let store = {
            let mut inner = self.inner.borrow_mut();
            let Some(at) = inner.interceptors.iter().position(|x| *x == id) else {
                return false;
            };
            inner.interceptors.remove(at);
            inner.store.clone()
        };
        store.stop_intercept(id)
    }

    /// Turns off container identity preservation under every mapped
    /// subtree, so each update yields fresh cells there.
    pub fn augment(&self) {
        let (store, bases) = {
            let mut inner = self.inner.borrow_mut();
            if inner.augmented {
                return;
            }
            inner.augmented = true;
            (
                inner.store.clone(),
                inner.map.values().cloned().collect::<Vec<_>>(),
            )
        };
        for base in bases {
            store.add_augmented(base);
        }
    }

    pub fn is_augmented(&self) -> bool {
        self.inner.borrow().augmented
    }

    /// Unregisters everything the fragment set up. Idempotent; the
    /// mapped data itself is untouched.
    pub fn dissolve(&self) {
        let (store, observers, interceptors, watch) = {
            let mut inner = self.inner.borrow_mut();
            if inner.dissolved {
                return;
            }
            inner.dissolved = true;
            (
                inner.store.clone(),
                std::mem::take(&mut inner.observers),
                std::mem::take(&mut inner.interceptors),
                inner.dissolve_watch.take(),
            )
        };
        for id in observers {
            store.stop_observe(id);
        }
        for id in interceptors {
            store.stop_intercept(id);
        }
        if let Some(id) = watch {
            store.stop_observe(id);
        }
        log::trace!(target: "statetree::fragment", "fragment dissolved");
    }

    pub fn is_dissolved(&self) -> bool {
        self.inner.borrow().dissolved
    }

    fn target(&self, relative: &Path) -> Result<(Store, Path), StoreError> {
        let inner = self.inner.borrow();
        if inner.dissolved {
            return Err(StoreError::FragmentDissolved);
        }
        let store = inner.store.clone();
        drop(inner);
        let absolute = self.absolute_path(relative)?;
        Ok((store, absolute))
    }
}
