//! Linear undo/redo history.
//!
//! Every recorded top-level write appends one changelog line (path and
//! the value it overwrote). Batches group lines into a single entry,
//! optionally aggregated per path. Undo replays lines in reverse while
//! lazily building the entry's forward oplog; redo replays that oplog
//! and releases it. The timeline is linear: a recorded write while the
//! cursor is rewound first drops the redo tail.
//!
//! Entries can be pruned to a limit and paged back in on demand through
//! a feed hook, so long-lived stores keep a bounded in-memory tail.

use crate::observers::Scheduler;
use crate::store::{Store, WriteMode};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statetree_path::{Path, PathError};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// One recorded write: the path and the value it overwrote (`None` when
/// the path was absent before the write).
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryLine {
    pub path: Path,
    pub value: Option<Value>,
}

/// One undoable step.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Millisecond timestamp with a per-millisecond counter suffix;
    /// lexicographic order on equal-length stamps is creation order.
    pub timestamp: String,
    /// Pre-write values, in write order.
    pub changelog: Vec<HistoryLine>,
    /// Forward replay log, index-aligned with `changelog`. Present only
    /// between an undo of this entry and its redo.
    pub oplog: Option<Vec<HistoryLine>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryEventKind {
    /// An entry was appended.
    Add,
    /// The cursor moved (undo or redo).
    Update,
    /// Entries were dropped (commit or prune).
    Delete,
}

pub type HistoryObserverFn = Rc<dyn Fn(HistoryEventKind)>;

/// Pages older entries back in when undo runs past the in-memory tail.
/// Called with the number of entries still wanted and the timestamp of
/// the oldest entry currently held; returns older entries in timeline
/// order, or empty when the archive is exhausted.
pub type HistoryFeed = Rc<dyn Fn(usize, &str) -> Vec<HistoryEntry>>;

/// Serialization-friendly entry layout: one `path=json` string per line,
/// with an empty value side for absence. Path tokens escape `=`, so the
/// first `=` in a line is always the separator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub timestamp: String,
    pub changelog: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oplog: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum HistoryCodecError {
    #[error("history line missing '=' separator: {0:?}")]
    MissingSeparator(String),
    #[error("bad path in history line: {0}")]
    Path(#[from] PathError),
    #[error("bad value in history line: {0}")]
    Value(#[from] serde_json::Error),
}

pub fn format_history_line(line: &HistoryLine) -> String {
    match &line.value {
        Some(value) => format!("{}={}", line.path, value),
        None => format!("{}=", line.path),
    }
}

pub fn parse_history_line(text: &str) -> Result<HistoryLine, HistoryCodecError> {
    let (path, value) = text
        .split_once('=')
        .ok_or_else(|| HistoryCodecError::MissingSeparator(text.to_string()))?;
    let path = Path::parse(path)?;
    let value = if value.is_empty() {
        None
    } else {
        Some(serde_json::from_str(value)?)
    };
    Ok(HistoryLine { path, value })
}

impl HistoryEntry {
    pub fn to_persisted(&self) -> PersistedEntry {
        PersistedEntry {
            timestamp: self.timestamp.clone(),
            changelog: self.changelog.iter().map(format_history_line).collect(),
            oplog: self
                .oplog
                .as_ref()
                .map(|lines| lines.iter().map(format_history_line).collect()),
        }
    }

    pub fn from_persisted(persisted: &PersistedEntry) -> Result<HistoryEntry, HistoryCodecError> {
        let changelog = persisted
            .changelog
            .iter()
            .map(|line| parse_history_line(line))
            .collect::<Result<_, _>>()?;
        let oplog = match &persisted.oplog {
            Some(lines) => Some(
                lines
                    .iter()
                    .map(|line| parse_history_line(line))
                    .collect::<Result<_, _>>()?,
            ),
            None => None,
        };
        Ok(HistoryEntry {
            timestamp: persisted.timestamp.clone(),
            changelog,
            oplog,
        })
    }
}

#[derive(Clone, Copy)]
struct BatchFrame {
    aggregate: bool,
    preserve_order: bool,
}

pub(crate) struct HistoryState {
    entries: Vec<HistoryEntry>,
    /// Steps behind the tip; 0 means at the tip.
    current: usize,
    /// Recording is suspended while positive (`stop_record` nests).
    disable_depth: usize,
    batch: Vec<BatchFrame>,
    open_entry: Option<HistoryEntry>,
    /// True while the pipeline holds an implicitly opened cascade batch.
    auto_batched: bool,
    limit: usize,
    prune_pending: bool,
    prune_scheduled: bool,
    feed: Option<HistoryFeed>,
    observers: IndexMap<u64, HistoryObserverFn>,
    ts_last: u128,
    ts_counter: u32,
}

impl HistoryState {
    pub fn new(entries: Vec<HistoryEntry>, cursor: usize, feed: Option<HistoryFeed>) -> Self {
        let current = cursor.min(entries.len());
        HistoryState {
            entries,
            current,
            disable_depth: 0,
            batch: Vec::new(),
            open_entry: None,
            auto_batched: false,
            limit: 0,
            prune_pending: false,
            prune_scheduled: false,
            feed,
            observers: IndexMap::new(),
            ts_last: 0,
            ts_counter: 0,
        }
    }

    fn timestamp(&mut self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        if now == self.ts_last {
            self.ts_counter += 1;
        } else {
            self.ts_last = now;
            self.ts_counter = 1;
        }
        format!("{}{:03}", now, self.ts_counter)
    }

    /// Drops the redo tail. Returns true when anything was dropped.
    fn drop_redo_tail(&mut self) -> bool {
        if self.current == 0 {
            return false;
        }
        let keep = self.entries.len() - self.current;
        self.entries.truncate(keep);
        self.current = 0;
        true
    }
}

impl Store {
    /// Re-enables recording after a matching `stop_record`.
    pub fn record(&self) {
        let mut h = self.shared.history.borrow_mut();
        h.disable_depth = h.disable_depth.saturating_sub(1);
    }

    /// Suspends recording. Calls nest; recording resumes once `record`
    /// has been called as many times.
    pub fn stop_record(&self) {
        self.shared.history.borrow_mut().disable_depth += 1;
    }

    pub fn is_recording(&self) -> bool {
        self.shared.history.borrow().disable_depth == 0
    }

    /// Opens a batch: recorded writes collect into a single entry until
    /// the matching `stop_batch`. With `aggregate`, repeated writes to a
    /// path keep only the oldest pre-write value; `preserve_order`
    /// restricts that collapse to consecutive lines. Batches nest, the
    /// innermost flags win.
    pub fn batch(&self, aggregate: bool, preserve_order: bool) {
        let mut h = self.shared.history.borrow_mut();
        h.batch.push(BatchFrame {
            aggregate,
            preserve_order,
        });
        if h.batch.len() == 1 {
            let timestamp = h.timestamp();
            h.open_entry = Some(HistoryEntry {
                timestamp,
                changelog: Vec::new(),
                oplog: None,
            });
        }
    }

    /// Closes the innermost batch. Closing the outermost commits the
    /// collected entry; an empty one is discarded. Returns false when no
    /// batch was open.
    pub fn stop_batch(&self) -> bool {
        let mut events = Vec::new();
        let closed = {
            let mut h = self.shared.history.borrow_mut();
            if h.batch.is_empty() {
                false
            } else {
                h.batch.pop();
                if h.batch.is_empty() {
                    if let Some(entry) = h.open_entry.take() {
                        if !entry.changelog.is_empty() {
                            h.entries.push(entry);
                            h.prune_pending = true;
                            events.push(HistoryEventKind::Add);
                        }
                    }
                }
                true
            }
        };
        self.notify_history(&events);
        if !events.is_empty() {
            self.maybe_schedule_prune();
        }
        closed
    }

    /// Rewinds up to `steps` entries, paging older ones in through the
    /// feed when the in-memory tail runs out. Returns the number of
    /// entries actually undone. With `defer`, observer notifications for
    /// all replayed writes coalesce into one resume.
    pub fn undo(&self, steps: usize, defer: bool) -> usize {
        if steps == 0 {
            return 0;
        }
        if defer {
            self.defer_observers();
        }
        let mut events = Vec::new();
        let mut completed = 0;
        while completed < steps {
            let (available, oldest) = {
                let h = self.shared.history.borrow();
                (
                    h.entries.len() > h.current,
                    h.entries.first().map(|e| e.timestamp.clone()),
                )
            };
            if !available {
                let feed = self.shared.history.borrow().feed.clone();
                let Some(feed) = feed else { break };
                let oldest = oldest.unwrap_or_default();
                let page = feed(steps - completed, &oldest);
                if page.is_empty() {
                    break;
                }
                log::trace!(
                    target: "statetree::history",
                    "feed returned {} entries older than {oldest:?}", page.len()
                );
                let mut h = self.shared.history.borrow_mut();
                h.entries.splice(0..0, page);
                continue;
            }
            let (index, changelog) = {
                let h = self.shared.history.borrow();
                let index = h.entries.len() - 1 - h.current;
                (index, h.entries[index].changelog.clone())
            };
            let mut oplog = Vec::with_capacity(changelog.len());
            for line in changelog.iter().rev() {
                let overwritten = self.resolve(&line.path);
                oplog.push(HistoryLine {
                    path: line.path.clone(),
                    value: overwritten,
                });
                self.replay(&line.path, line.value.clone());
            }
            oplog.reverse();
            {
                let mut h = self.shared.history.borrow_mut();
                h.entries[index].oplog = Some(oplog);
                h.current += 1;
            }
            events.push(HistoryEventKind::Update);
            completed += 1;
        }
        self.notify_history(&events);
        if defer {
            self.resume_observers(false);
        }
        completed
    }

    /// Replays up to `steps` undone entries forward, consuming their
    /// oplogs. Returns the number of entries actually redone.
    pub fn redo(&self, steps: usize, defer: bool) -> usize {
        if steps == 0 {
            return 0;
        }
        if defer {
            self.defer_observers();
        }
        let mut events = Vec::new();
        let mut completed = 0;
        while completed < steps {
            let oplog = {
                let mut h = self.shared.history.borrow_mut();
                if h.current == 0 {
                    None
                } else {
                    let index = h.entries.len() - h.current;
                    h.entries[index].oplog.take()
                }
            };
            let Some(oplog) = oplog else { break };
            for line in oplog {
                self.replay(&line.path, line.value);
            }
            self.shared.history.borrow_mut().current -= 1;
            events.push(HistoryEventKind::Update);
            completed += 1;
        }
        self.notify_history(&events);
        if defer {
            self.resume_observers(false);
        }
        completed
    }

    /// Makes the current rewound position final by dropping the redo
    /// tail. A recorded write while rewound does this implicitly.
    pub fn commit_history(&self) {
        let dropped = self.shared.history.borrow_mut().drop_redo_tail();
        if dropped {
            self.notify_history(&[HistoryEventKind::Delete]);
        }
    }

    /// Drops the oldest entries until `keep` remain (`None` uses the
    /// configured limit; a limit of 0 means unbounded). Returns the
    /// removed entries, oldest first, for archival.
    pub fn prune(&self, keep: Option<usize>) -> Vec<HistoryEntry> {
        let removed = {
            let mut h = self.shared.history.borrow_mut();
            let keep = match keep {
                Some(keep) => keep,
                None if h.limit > 0 => h.limit,
                None => return Vec::new(),
            };
            h.prune_pending = false;
            if h.entries.len() <= keep {
                return Vec::new();
            }
            let cut = h.entries.len() - keep;
            let removed: Vec<HistoryEntry> = h.entries.drain(0..cut).collect();
            h.current = h.current.min(h.entries.len());
            removed
        };
        self.notify_history(&[HistoryEventKind::Delete]);
        removed
    }

    pub fn observe_history(&self, callback: impl Fn(HistoryEventKind) + 'static) -> u64 {
        let id = self.next_id();
        self.shared
            .history
            .borrow_mut()
            .observers
            .insert(id, Rc::new(callback));
        id
    }

    pub fn stop_observe_history(&self, id: u64) -> bool {
        self.shared
            .history
            .borrow_mut()
            .observers
            .shift_remove(&id)
            .is_some()
    }

    /// Snapshot of the in-memory timeline, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.history.borrow().entries.clone()
    }

    pub fn history_len(&self) -> usize {
        self.shared.history.borrow().entries.len()
    }

    /// Steps behind the tip; 0 means at the tip.
    pub fn history_current(&self) -> usize {
        self.shared.history.borrow().current
    }

    /// Moves the cursor to `target` steps behind the tip via undo/redo.
    /// Returns the cursor actually reached.
    pub fn set_history_current(&self, target: usize) -> usize {
        let current = self.history_current();
        if target > current {
            self.undo(target - current, true);
        } else if target < current {
            self.redo(current - target, true);
        }
        self.history_current()
    }

    pub fn history_limit(&self) -> usize {
        self.shared.history.borrow().limit
    }

    /// Caps the in-memory timeline; 0 disables the cap. Excess entries
    /// are pruned lazily after the next flush.
    pub fn set_history_limit(&self, limit: usize) {
        let mut h = self.shared.history.borrow_mut();
        h.limit = limit;
        if limit > 0 && h.entries.len() > limit {
            h.prune_pending = true;
        }
    }

    pub fn set_history_feed(&self, feed: Option<HistoryFeed>) {
        self.shared.history.borrow_mut().feed = feed;
    }

    /// Records one committed top-level write.
    pub(crate) fn log_write(&self, path: &Path, old: &Option<Value>) {
        let mut events = Vec::new();
        {
            let mut h = self.shared.history.borrow_mut();
            if h.disable_depth > 0 {
                return;
            }
            if h.drop_redo_tail() {
                events.push(HistoryEventKind::Delete);
            }
            let line = HistoryLine {
                path: path.clone(),
                value: old.clone(),
            };
            let frame = h.batch.last().copied();
            let batched = match (frame, h.open_entry.as_mut()) {
                (Some(frame), Some(entry)) => {
                    let skip = frame.aggregate
                        && if frame.preserve_order {
                            entry.changelog.last().is_some_and(|l| l.path == line.path)
                        } else {
                            entry.changelog.iter().any(|l| l.path == line.path)
                        };
                    if !skip {
                        entry.changelog.push(line.clone());
                    }
                    true
                }
                _ => false,
            };
            if !batched {
                let timestamp = h.timestamp();
                h.entries.push(HistoryEntry {
                    timestamp,
                    changelog: vec![line],
                    oplog: None,
                });
                h.prune_pending = true;
                events.push(HistoryEventKind::Add);
            }
        }
        self.notify_history(&events);
    }

    /// Opens the implicit batch that groups a cascade under one entry.
    pub(crate) fn auto_batch_open(&self) {
        let open = {
            let mut h = self.shared.history.borrow_mut();
            if h.auto_batched || !h.batch.is_empty() || h.disable_depth > 0 {
                false
            } else {
                h.auto_batched = true;
                true
            }
        };
        if open {
            self.batch(false, false);
        }
    }

    pub(crate) fn auto_batch_close(&self) {
        let close = {
            let mut h = self.shared.history.borrow_mut();
            if h.auto_batched {
                h.auto_batched = false;
                true
            } else {
                false
            }
        };
        if close {
            self.stop_batch();
        }
    }

    /// Debounced limit enforcement, run through the scheduler after a
    /// flush so a burst of writes prunes once.
    pub(crate) fn maybe_schedule_prune(&self) {
        let due = {
            let mut h = self.shared.history.borrow_mut();
            if h.limit > 0 && h.prune_pending && !h.prune_scheduled && h.entries.len() > h.limit {
                h.prune_scheduled = true;
                true
            } else {
                false
            }
        };
        if due {
            let store = self.clone();
            let scheduler = self.scheduler();
            scheduler.schedule(Box::new(move || {
                store.shared.history.borrow_mut().prune_scheduled = false;
                let removed = store.prune(None);
                if !removed.is_empty() {
                    log::trace!(
                        target: "statetree::history",
                        "pruned {} entries past the limit", removed.len()
                    );
                }
            }));
        }
    }

    fn replay(&self, path: &Path, value: Option<Value>) {
        if let Err(err) = self.write_internal(path, value, WriteMode::Replay) {
            log::warn!(target: "statetree::history", "replay at {path} failed: {err}");
        }
    }

    fn notify_history(&self, events: &[HistoryEventKind]) {
        if events.is_empty() {
            return;
        }
        let callbacks: Vec<HistoryObserverFn> = self
            .shared
            .history
            .borrow()
            .observers
            .values()
            .cloned()
            .collect();
        for event in events {
            for callback in &callbacks {
                callback(*event);
            }
        }
    }
}
