//! Pre-commit interceptor middleware.
//!
//! Interceptors transform or veto a candidate value before it reaches
//! the tree. A top-level write runs the full chain: deep interceptors on
//! strict ancestors root-down, then child-scope interceptors on the
//! parent, then exact interceptors on the written path. While the diff
//! recurses below a top-level write, only exact interceptors at each
//! nested path run.
//!
//! Returning a value structurally equal to the current one vetoes the
//! write and short-circuits the rest of the chain.

use crate::meta::MetaTree;
use crate::store::Store;
use serde_json::Value;
use statetree_path::Path;
use std::collections::HashMap;
use std::rc::Rc;

/// Context handed to every interceptor invocation.
///
/// The store reference allows cascading writes from inside the chain;
/// those nest the full pipeline (interceptors included) up to the
/// cascade depth limit.
pub struct InterceptCtx<'a> {
    pub store: &'a Store,
    /// Path whose value is being intercepted.
    pub path: &'a Path,
    /// Current value at `path`; `None` when absent.
    pub old: Option<&'a Value>,
    /// Top-level written path that triggered this chain.
    pub origin_path: &'a Path,
    /// Value at `origin_path` before the write.
    pub origin_old: Option<&'a Value>,
}

pub type InterceptorFn = Rc<dyn Fn(&InterceptCtx<'_>, Option<Value>) -> Option<Value>>;

struct InterceptorItem {
    path: Path,
    callback: InterceptorFn,
}

#[derive(Default)]
pub(crate) struct InterceptorRegistry {
    tree: MetaTree,
    items: HashMap<u64, InterceptorItem>,
}

impl Store {
    /// Registers an interceptor on `path`. `children` also intercepts
    /// writes to direct children, `deep` writes anywhere below.
    pub fn intercept(
        &self,
        path: &Path,
        callback: impl Fn(&InterceptCtx<'_>, Option<Value>) -> Option<Value> + 'static,
        children: bool,
        deep: bool,
    ) -> u64 {
        let id = self.next_id();
        let mut reg = self.shared.interceptors.borrow_mut();
        reg.tree.register(path, id, children, deep);
        reg.items.insert(
            id,
            InterceptorItem {
                path: path.clone(),
                callback: Rc::new(callback),
            },
        );
        id
    }

    pub fn stop_intercept(&self, id: u64) -> bool {
        let mut reg = self.shared.interceptors.borrow_mut();
        match reg.items.remove(&id) {
            Some(item) => {
                reg.tree.unregister(&item.path, id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_exact_interceptors(&self, path: &Path) -> bool {
        self.shared.interceptors.borrow().tree.has_exact(path)
    }

    /// Runs the chain for one candidate write. Returns the transformed
    /// candidate and whether some interceptor vetoed it.
    ///
    /// The id list is snapshotted up front; interceptors registered by a
    /// callback mid-chain only see later writes. An id stopped mid-chain
    /// is skipped when its turn comes.
    pub(crate) fn dispatch_interceptors(
        &self,
        path: &Path,
        old: &Option<Value>,
        origin_path: &Path,
        origin_old: &Option<Value>,
        mut candidate: Option<Value>,
        full_chain: bool,
    ) -> (Option<Value>, bool) {
        let ids: Vec<u64> = {
            let reg = self.shared.interceptors.borrow();
            if full_chain {
                let mut ids = Vec::new();
                let prefixes = path.strict_prefixes();
                if let Some((parent, ancestors)) = prefixes.split_last() {
                    for ancestor in ancestors {
                        ids.extend(reg.tree.deep_at(ancestor));
                    }
                    // children scope at the parent covers deep ids there
                    ids.extend(reg.tree.children_at(parent));
                }
                ids.extend(reg.tree.exact_at(path));
                ids
            } else {
                reg.tree.exact_at(path)
            }
        };
        for id in ids {
            let callback = {
                let reg = self.shared.interceptors.borrow();
                reg.items.get(&id).map(|item| item.callback.clone())
            };
            let Some(callback) = callback else { continue };
            let ctx = InterceptCtx {
                store: self,
                path,
                old: old.as_ref(),
                origin_path,
                origin_old: origin_old.as_ref(),
            };
            candidate = callback(&ctx, candidate);
            if candidate == *old {
                return (candidate, true);
            }
        }
        (candidate, false)
    }
}
