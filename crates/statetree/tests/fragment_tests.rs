use serde_json::json;
use statetree::{Path, Store, StoreError};
use std::cell::RefCell;
use std::rc::Rc;

fn path(text: &str) -> Path {
    Path::parse(text).unwrap()
}

fn sample_store() -> Store {
    Store::new(Some(json!({
        "users": {"u1": {"name": "ada", "tags": ["admin"]}},
        "prefs": {"theme": "dark"}
    })))
    .unwrap()
}

#[test]
fn paths_translate_both_ways() {
    let store = sample_store();
    let frag = store.fragment(
        [
            ("user".to_string(), path(".users.u1")),
            ("prefs".to_string(), path(".prefs")),
        ],
        None,
    );

    assert_eq!(
        frag.absolute_path(&path(".user.name")).unwrap(),
        path(".users.u1.name")
    );
    assert_eq!(frag.absolute_path(&path(".prefs")).unwrap(), path(".prefs"));
    assert_eq!(
        frag.relative_path(&path(".users.u1.tags.0")),
        Some(path(".user.tags.0"))
    );
    assert_eq!(frag.relative_path(&path(".elsewhere")), None);

    assert!(matches!(
        frag.absolute_path(&path(".unknown.x")),
        Err(StoreError::UnmappedFragmentPath(_))
    ));
    assert!(matches!(
        frag.absolute_path(&Path::root()),
        Err(StoreError::FragmentRoot)
    ));
}

#[test]
fn reads_and_writes_go_through_the_mapping() {
    let store = sample_store();
    let frag = store.fragment([("user".to_string(), path(".users.u1"))], None);

    assert_eq!(frag.get(&path(".user.name")).unwrap(), Some(json!("ada")));
    assert!(frag.set(&path(".user.name"), json!("grace")).unwrap());
    assert_eq!(
        store.resolve(&path(".users.u1.name")),
        Some(json!("grace"))
    );
    assert!(frag.delete(&path(".user.tags")).unwrap());
    assert_eq!(store.resolve(&path(".users.u1.tags")), None);
}

#[test]
fn fragment_observers_see_relative_paths() {
    let store = sample_store();
    let frag = store.fragment([("user".to_string(), path(".users.u1"))], None);

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    frag.observe(
        &path(".user.name"),
        move |event| sink.borrow_mut().push((event.path.clone(), event.old.clone())),
        false,
        false,
        false,
    )
    .unwrap();

    // a write through the store still reaches the fragment observer
    store.set(&path(".users.u1.name"), json!("grace")).unwrap();
    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, path(".user.name"));
    assert_eq!(events[0].1, Some(json!("ada")));
}

#[test]
fn fragment_interceptors_see_relative_context() {
    let store = sample_store();
    let frag = store.fragment([("user".to_string(), path(".users.u1"))], None);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    frag.intercept(
        &path(".user.name"),
        move |ctx, candidate| {
            sink.borrow_mut().push(ctx.path.clone());
            candidate.map(|v| json!(format!("{}!", v.as_str().unwrap_or(""))))
        },
        false,
        false,
    )
    .unwrap();

    frag.set(&path(".user.name"), json!("grace")).unwrap();
    assert_eq!(*seen.borrow(), vec![path(".user.name")]);
    assert_eq!(
        store.resolve(&path(".users.u1.name")),
        Some(json!("grace!"))
    );
}

#[test]
fn dissolve_detaches_everything_and_is_idempotent() {
    let store = sample_store();
    let frag = store.fragment([("user".to_string(), path(".users.u1"))], None);

    let calls = Rc::new(RefCell::new(0));
    let sink = calls.clone();
    frag.observe(
        &path(".user.name"),
        move |_| *sink.borrow_mut() += 1,
        false,
        false,
        false,
    )
    .unwrap();
    frag.intercept(
        &path(".user.name"),
        |_ctx, _| Some(json!("blocked")),
        false,
        false,
    )
    .unwrap();

    frag.dissolve();
    assert!(frag.is_dissolved());
    frag.dissolve();

    store.set(&path(".users.u1.name"), json!("grace")).unwrap();
    assert_eq!(*calls.borrow(), 0);
    assert_eq!(
        store.resolve(&path(".users.u1.name")),
        Some(json!("grace"))
    );
    assert!(matches!(
        frag.get(&path(".user.name")),
        Err(StoreError::FragmentDissolved)
    ));
    assert!(matches!(
        frag.set(&path(".user.name"), json!("x")),
        Err(StoreError::FragmentDissolved)
    ));
}

#[test]
fn fragments_auto_dissolve_when_the_watched_path_vanishes() {
    let store = sample_store();
    let frag = store.fragment(
        [("user".to_string(), path(".users.u1"))],
        Some(&path(".users.u1")),
    );
    assert!(!frag.is_dissolved());

    store.set(&path(".users.u1.name"), json!("grace")).unwrap();
    assert!(!frag.is_dissolved());

    store.delete(&path(".users.u1")).unwrap();
    assert!(frag.is_dissolved());
}

#[test]
fn augmented_fragments_give_up_identity_preservation() {
    let store = sample_store();
    let frag = store.fragment([("user".to_string(), path(".users.u1"))], None);
    frag.augment();
    assert!(frag.is_augmented());

    let handle = store.node(&path(".users.u1")).unwrap();
    store
        .set(&path(".users.u1"), json!({"name": "grace", "tags": ["admin"]}))
        .unwrap();
    assert!(!handle.is_connected());
    // elsewhere identity preservation still applies
    let prefs = store.node(&path(".prefs")).unwrap();
    store.set(&path(".prefs"), json!({"theme": "light"})).unwrap();
    assert!(prefs.is_connected());
}
