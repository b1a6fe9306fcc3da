use proptest::prelude::*;
use serde_json::{json, Value};
use statetree::{Path, Store};

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn written_values_read_back_unchanged(value in json_value()) {
        let store = Store::new(Some(json!({}))).unwrap();
        let slot = Path::root().key("slot");
        store.set(&slot, value.clone()).unwrap();
        prop_assert_eq!(store.resolve(&slot), Some(value));
    }

    #[test]
    fn undo_then_redo_restores_both_states(first in json_value(), second in json_value()) {
        prop_assume!(first != second);
        let store = Store::new(Some(json!({}))).unwrap();
        let slot = Path::root().key("slot");
        store.set(&slot, first.clone()).unwrap();
        store.set(&slot, second.clone()).unwrap();
        prop_assert_eq!(store.history_len(), 2);

        prop_assert_eq!(store.undo(1, true), 1);
        prop_assert_eq!(store.resolve(&slot), Some(first));
        prop_assert_eq!(store.redo(1, true), 1);
        prop_assert_eq!(store.resolve(&slot), Some(second));
    }

    #[test]
    fn writes_leave_siblings_untouched(a in json_value(), b in json_value()) {
        let store = Store::new(Some(json!({}))).unwrap();
        store.set(&Path::root().key("a"), a.clone()).unwrap();
        store.set(&Path::root().key("b"), b).unwrap();
        prop_assert_eq!(store.resolve(&Path::root().key("a")), Some(a));
    }

    #[test]
    fn diffed_updates_converge_to_the_new_value(old in json_value(), new in json_value()) {
        let store = Store::new(Some(json!({}))).unwrap();
        let slot = Path::root().key("slot");
        store.set(&slot, old).unwrap();
        let committed = store.set(&slot, new.clone()).unwrap();
        prop_assert_eq!(store.resolve(&slot), Some(new));
        let _ = committed;
    }
}
