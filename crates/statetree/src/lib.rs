//! An observable, undoable in-process state tree.
//!
//! A [`Store`] owns one JSON-shaped tree behind a single-writer pipeline:
//! every write resolves its parent, runs registered interceptors,
//! reconciles the subtree key by key (preserving container identity
//! where the shape survives), records an undo entry and notifies scoped
//! observers. [`Fragment`]s expose relative views over mapped subtrees.
//!
//! ```
//! use serde_json::json;
//! use statetree::{Path, Store};
//!
//! let store = Store::new(Some(json!({"user": {"name": "ada"}}))).unwrap();
//! let name = Path::parse(".user.name").unwrap();
//!
//! store.set(&name, json!("grace")).unwrap();
//! assert_eq!(store.resolve(&name), Some(json!("grace")));
//!
//! store.undo(1, true);
//! assert_eq!(store.resolve(&name), Some(json!("ada")));
//! ```

mod fragment;
mod history;
mod interceptors;
mod meta;
mod node;
mod observers;
mod reconcile;
mod store;

pub use fragment::Fragment;
pub use history::{
    format_history_line, parse_history_line, HistoryCodecError, HistoryEntry, HistoryEventKind,
    HistoryFeed, HistoryLine, HistoryObserverFn, PersistedEntry,
};
pub use interceptors::{InterceptCtx, InterceptorFn};
pub use node::BranchKind;
pub use observers::{ChangeEvent, InlineScheduler, ObserverFn, QueueScheduler, Scheduler};
pub use store::{NodeRef, Store, StoreError, MAX_CASCADE_DEPTH};

pub use statetree_path::{Path, PathError};
