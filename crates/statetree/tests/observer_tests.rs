use serde_json::json;
use statetree::{ChangeEvent, Path, QueueScheduler, Store};
use std::cell::RefCell;
use std::rc::Rc;

fn path(text: &str) -> Path {
    Path::parse(text).unwrap()
}

fn store_with(initial: serde_json::Value) -> Store {
    Store::new(Some(initial)).unwrap()
}

type Log = Rc<RefCell<Vec<ChangeEvent>>>;

fn recorder(store: &Store, at: &str, children: bool, deep: bool) -> Log {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    store.observe(
        &path(at),
        move |event| sink.borrow_mut().push(event.clone()),
        children,
        deep,
        false,
    );
    log
}

#[test]
fn exact_observer_sees_path_and_old_value() {
    let store = store_with(json!({"a": 1}));
    let log = recorder(&store, ".a", false, false);

    store.set(&path(".a"), json!(2)).unwrap();
    store.delete(&path(".a")).unwrap();

    let events = log.borrow();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].path, path(".a"));
    assert_eq!(events[0].old, Some(json!(1)));
    assert_eq!(events[1].old, Some(json!(2)));
}

#[test]
fn observer_scopes_fire_for_the_written_path() {
    let store = store_with(json!({"a": {"b": {}}}));
    let exact = recorder(&store, ".a.b.c", false, false);
    let children = recorder(&store, ".a.b", true, false);
    let deep = recorder(&store, "", false, true);
    let sibling = recorder(&store, ".a.x", true, false);

    store.set(&path(".a.b.c"), json!(1)).unwrap();

    assert_eq!(exact.borrow().len(), 1);
    assert_eq!(children.borrow().len(), 1);
    assert_eq!(deep.borrow().len(), 1);
    assert_eq!(sibling.borrow().len(), 0);

    let event = &deep.borrow()[0];
    assert_eq!(event.path, path(".a.b.c"));
    assert_eq!(event.origin_path, path(".a.b.c"));
}

#[test]
fn children_scope_does_not_reach_grandchildren() {
    let store = store_with(json!({"a": {"b": {}}}));
    let children = recorder(&store, ".a", true, false);
    let deep = recorder(&store, ".a", false, true);

    store.set(&path(".a.b.c"), json!(1)).unwrap();
    assert_eq!(children.borrow().len(), 0);
    assert_eq!(deep.borrow().len(), 1);

    store.set(&path(".a.b"), json!({"c": 2})).unwrap();
    assert_eq!(children.borrow().len(), 1);
    assert_eq!(deep.borrow().len(), 2);
}

#[test]
fn nested_changes_notify_exact_observers_with_origin() {
    let store = store_with(json!({"a": {"b": 1, "keep": true}}));
    let nested = recorder(&store, ".a.b", false, false);
    let kept = recorder(&store, ".a.keep", false, false);

    store.set(&path(".a"), json!({"b": 2, "keep": true})).unwrap();

    let events = nested.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, path(".a.b"));
    assert_eq!(events[0].old, Some(json!(1)));
    assert_eq!(events[0].origin_path, path(".a"));
    assert_eq!(events[0].origin_old, Some(json!({"b": 1, "keep": true})));
    // untouched keys stay silent
    assert_eq!(kept.borrow().len(), 0);
}

#[test]
fn nested_deletions_notify_exact_observers() {
    let store = store_with(json!({"a": {"b": {"c": 3}}}));
    let log = recorder(&store, ".a.b.c", false, false);

    store.set(&path(".a"), json!(1)).unwrap();
    let events = log.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].old, Some(json!(3)));
}

#[test]
fn each_observer_fires_at_most_once_per_commit() {
    let store = store_with(json!({"a": {"b": 1, "c": 2}}));
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    // registered at each of .a.b and .a.c via a deep scope at .a
    store.observe(
        &path(".a"),
        move |event| sink.borrow_mut().push(event.clone()),
        true,
        true,
        false,
    );

    store.set(&path(".a"), json!({"b": 9, "c": 8})).unwrap();
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn init_fires_immediately_without_a_change() {
    let store = store_with(json!({"a": 1}));
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    store.observe(
        &path(".a"),
        move |event| sink.borrow_mut().push(event.clone()),
        false,
        false,
        true,
    );
    let events = log.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, path(".a"));
    assert_eq!(events[0].old, None);
}

#[test]
fn stopped_observers_no_longer_fire() {
    let store = store_with(json!({"a": 1}));
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let id = store.observe(
        &path(".a"),
        move |event| sink.borrow_mut().push(event.clone()),
        false,
        false,
        false,
    );

    store.set(&path(".a"), json!(2)).unwrap();
    assert!(store.stop_observe(id));
    assert!(!store.stop_observe(id));
    store.set(&path(".a"), json!(3)).unwrap();
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn deferred_writes_coalesce_per_path_keeping_the_oldest_value() {
    let store = store_with(json!({"a": 1}));
    let log = recorder(&store, ".a", false, false);

    store.defer_observers();
    store.set(&path(".a"), json!(2)).unwrap();
    store.set(&path(".a"), json!(3)).unwrap();
    assert_eq!(log.borrow().len(), 0);

    store.resume_observers(false);
    let events = log.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].old, Some(json!(1)));
}

#[test]
fn retouched_paths_migrate_to_the_innermost_deferral_level() {
    let store = store_with(json!({"a": 1}));
    let log = recorder(&store, ".a", false, false);

    store.defer_observers();
    store.set(&path(".a"), json!(2)).unwrap();
    store.defer_observers();
    store.set(&path(".a"), json!(3)).unwrap();

    store.resume_observers(false);
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(log.borrow()[0].old, Some(json!(1)));

    store.resume_observers(false);
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn resume_all_drains_every_level() {
    let store = store_with(json!({"a": 1, "b": 1}));
    let a = recorder(&store, ".a", false, false);
    let b = recorder(&store, ".b", false, false);

    store.defer_observers();
    store.set(&path(".a"), json!(2)).unwrap();
    store.defer_observers();
    store.set(&path(".b"), json!(2)).unwrap();

    store.resume_observers(true);
    assert_eq!(a.borrow().len(), 1);
    assert_eq!(b.borrow().len(), 1);
}

#[test]
fn refresh_refires_with_the_current_value() {
    let store = store_with(json!({"a": {"b": 1}}));
    let log = recorder(&store, ".a", false, false);

    store.refresh(&path(".a"));
    let events = log.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].old, Some(json!({"b": 1})));
}

#[test]
fn async_delivery_routes_through_the_scheduler() {
    let store = store_with(json!({"a": 1}));
    let scheduler = Rc::new(QueueScheduler::new());
    store.set_scheduler(scheduler.clone());
    store.set_observe_async(true);
    let log = recorder(&store, ".a", false, false);

    store.set(&path(".a"), json!(2)).unwrap();
    assert_eq!(log.borrow().len(), 0);
    assert_eq!(scheduler.run(), 1);
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(log.borrow()[0].old, Some(json!(1)));
}

#[test]
fn observers_can_write_back_without_reentrancy_issues() {
    let store = store_with(json!({"a": 1, "mirror": 0}));
    let mirror = store.clone();
    store.observe(
        &path(".a"),
        move |event| {
            if let Some(value) = mirror.resolve(&path(".a")) {
                let _ = mirror.set(&path(".mirror"), value);
            }
            let _ = event;
        },
        false,
        false,
        false,
    );

    store.set(&path(".a"), json!(7)).unwrap();
    assert_eq!(store.resolve(&path(".mirror")), Some(json!(7)));
}
