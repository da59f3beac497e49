use serde_json::json;
use std::rc::Rc;
use viewmodel_cache::prelude::*;
use viewmodel_cache::test::{change_recorder, counter, text, TestSchema};

#[test]
fn subset_views_follow_superset_writes() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let partial = FieldPath::list(["name", "email"]);
    let full = FieldPath::list(["name", "email", "age"]);

    users.add(json!({"id": 1, "name": "Jo", "email": "jo@a.test"})).unwrap();
    let wide = users
        .add(json!({"id": 1, "name": "Joanna", "email": "joanna@a.test", "age": 30}))
        .unwrap();

    let view = users.get(1, &partial).unwrap().unwrap();
    assert_eq!(view, wide.clone_fields(&schema.user.field_set(&partial).unwrap()).unwrap());
    assert_eq!(text(&view, "name"), "Joanna");
    assert!(!view.has("age"));

    // A narrower write updates its own view only.
    users.add(json!({"id": 1, "name": "Jo", "email": "jo@a.test"})).unwrap();
    assert_eq!(text(&users.get(1, &partial).unwrap().unwrap(), "name"), "Jo");
    assert!(users.get(1, &full).unwrap().unwrap().ptr_eq(&wide));
}

#[test]
fn equal_writes_change_nothing() {
    let schema = TestSchema::new();
    let users = schema.user.cache();

    let first = users.add(json!({"id": 1, "name": "Jo"})).unwrap();
    let (listener, calls) = change_recorder();
    let _unsubscribe = users
        .add_listener(Listen::record(1, FieldPath::list(["name"]), listener))
        .unwrap();
    let (any, count) = counter();
    let _any = users.add_listener(Listen::AnyChange(any)).unwrap();

    users.add(json!({"id": 1, "name": "Jo"})).unwrap();

    assert!(calls.borrow().is_empty());
    assert_eq!(*count.borrow(), 0);
    assert!(users
        .get(1, &FieldPath::list(["name"]))
        .unwrap()
        .unwrap()
        .ptr_eq(&first));
}

#[test]
fn most_recent_superset_wins() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let name = FieldPath::list(["name"]);

    users.add(json!({"id": 1, "name": "Old", "email": "old@a.test"})).unwrap();
    users.add(json!({"id": 1, "name": "New", "age": 3})).unwrap();
    let view = users.get(1, &name).unwrap().unwrap();
    assert_eq!(text(&view, "name"), "New");
    assert_eq!(view.assigned_fields(), ["id", "name"]);

    users.add(json!({"id": 2, "name": "New", "age": 3})).unwrap();
    users.add(json!({"id": 2, "name": "Old", "email": "old@a.test"})).unwrap();
    assert_eq!(text(&users.get(2, &name).unwrap().unwrap(), "name"), "Old");
}

#[test]
fn round_trip() {
    let schema = TestSchema::new();
    let users = schema.user.cache();

    let added = users.add(json!({"id": 7, "name": "Jo", "age": "41"})).unwrap();
    assert_eq!(added.value("age"), Some(&json!(41)));

    let paths = added.field_set().unwrap().field_paths();
    assert!(users.get(7, &paths).unwrap().unwrap().ptr_eq(&added));
    assert!(users.get(&added, &[]).unwrap().unwrap().ptr_eq(&added));

    let again = users.add(added.clone()).unwrap();
    assert!(again.ptr_eq(&added));
    assert!(users.get(7, &paths).unwrap().unwrap().ptr_eq(&added));
}

#[test]
fn get_all_keeps_identity() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let name = FieldPath::list(["name"]);

    users
        .add_list([
            json!({"id": 1, "name": "A"}),
            json!({"id": 2, "name": "B"}),
            json!({"id": 3, "email": "no-name@a.test"}),
        ])
        .unwrap();

    let first = users.get_all(&name).unwrap();
    let second = users.get_all(&name).unwrap();
    assert_eq!(first.len(), 2);
    assert!(Rc::ptr_eq(&first, &second));

    users.add(json!({"id": 2, "name": "C"})).unwrap();
    let third = users.get_all(&name).unwrap();
    assert!(!Rc::ptr_eq(&second, &third));
    assert!(third[0].ptr_eq(&second[0]));
    assert!(!third[1].ptr_eq(&second[1]));
    assert_eq!(text(&third[1], "name"), "C");
}

#[test]
fn get_list_reports_misses() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let name = FieldPath::list(["name"]);

    users
        .add_list([json!({"id": 1, "name": "A"}), json!({"id": 2, "name": "B"})])
        .unwrap();

    let all = users.get_list([1, 5, 2], &name, false).unwrap();
    assert_eq!(all.len(), 3);
    assert!(all[1].is_none());
    assert_eq!(text(all[2].as_ref().unwrap(), "name"), "B");

    let found = users.get_list([1, 5, 2], &name, true).unwrap();
    assert_eq!(found.len(), 2);
}

#[test]
fn delete_whole_record_or_one_view() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let name = FieldPath::list(["name"]);
    let both = FieldPath::list(["name", "email"]);

    users.add(json!({"id": 1, "name": "Jo", "email": "jo@a.test"})).unwrap();
    assert!(users.get(1, &name).unwrap().is_some());

    assert!(users.delete(1, Some(name.as_slice())).unwrap());
    assert!(!users.delete(1, Some(name.as_slice())).unwrap());
    assert!(users.get(1, &both).unwrap().is_some());
    // Served from the wider record again.
    assert!(users.get(1, &name).unwrap().is_some());

    assert!(users.delete(1, None).unwrap());
    assert!(users.get(1, &both).unwrap().is_none());
    assert!(users.get(1, &name).unwrap().is_none());
    assert!(!users.delete(1, None).unwrap());
}

#[test]
fn clear_keeps_listeners() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let name = FieldPath::list(["name"]);

    users
        .add_list([json!({"id": 1, "name": "A"}), json!({"id": 2, "name": "B"})])
        .unwrap();
    let (listener, calls) = change_recorder();
    let _unsubscribe = users.add_listener(Listen::record(1, name.clone(), listener)).unwrap();

    schema.system.clear().unwrap();
    assert!(users.get_all(&name).unwrap().is_empty());
    assert_eq!(calls.borrow().len(), 1);
    assert!(calls.borrow()[0].1.is_none());

    users.add(json!({"id": 1, "name": "Back"})).unwrap();
    assert_eq!(calls.borrow().len(), 2);
    assert_eq!(text(calls.borrow()[1].1.as_ref().unwrap(), "name"), "Back");
}

#[test]
fn placeholders_are_tracked_once() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let name = FieldPath::list(["name"]);

    assert!(users.add_key_placeholder(1, &name).unwrap());
    assert!(!users.add_key_placeholder(1, &name).unwrap());
    assert!(users.get(1, &name).unwrap().is_none());

    users.add(json!({"id": 1, "name": "Jo", "email": "jo@a.test"})).unwrap();
    assert_eq!(text(&users.get(1, &name).unwrap().unwrap(), "name"), "Jo");
}

#[test]
fn records_must_match_the_cache_type() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let group = schema.group.record(&json!({"id": 1, "name": "G"})).unwrap();

    let err = users.add(group.clone()).unwrap_err();
    assert_eq!(
        err,
        CacheError::WrongEntityType {
            expected: "User".into(),
            got:      "Group".into(),
        }
    );
    assert!(matches!(users.get(&group, &[]), Err(CacheError::WrongEntityType { .. })));
    assert!(matches!(
        users.add(json!([{"id": 1}])),
        Err(CacheError::InvalidData { .. })
    ));
}

#[test]
fn primary_keys_are_validated() {
    let schema = TestSchema::new();
    let items = schema.item.cache();
    let users = schema.user.cache();
    let quantity = FieldPath::list(["quantity"]);

    let missing = items.add(json!({"orderId": 1, "quantity": 2})).unwrap_err();
    let null = items.add(json!({"orderId": 1, "productId": null})).unwrap_err();
    assert_eq!(
        missing,
        CacheError::MissingPrimaryKey {
            entity: "Item".into(),
            fields: vec!["productId".into()],
        }
    );
    assert_eq!(
        null,
        CacheError::NullPrimaryKey {
            entity: "Item".into(),
            fields: vec!["productId".into()],
        }
    );
    assert_ne!(missing.to_string(), null.to_string());
    assert!(null.to_string().contains("'productId' was provided but was null"));

    items.add(json!({"orderId": 1, "productId": 2, "quantity": 3})).unwrap();
    let item = items
        .get(json!({"productId": 2, "orderId": 1}), &quantity)
        .unwrap()
        .unwrap();
    assert_eq!(item.value("quantity"), Some(&json!(3)));
    assert_eq!(item.pk(), json!({"orderId": 1, "productId": 2}));

    let err = items.get(1, &quantity).unwrap_err();
    assert!(err.to_string().contains("compound key of orderId, productId"));
    let err = items.get(json!({"orderId": 1}), &quantity).unwrap_err();
    assert!(err.to_string().contains("Missing value(s) for field(s) productId"));

    let name = FieldPath::list(["name"]);
    let err = users.get(json!({"id": 1}), &name).unwrap_err();
    assert!(err.to_string().contains("single primary key named 'id'"));
    let err = users.get(json!(null), &name).unwrap_err();
    assert!(err.to_string().contains("Primary key must be provided"));
}

#[test]
fn bad_input_is_reported_or_skipped() {
    let schema = TestSchema::new();
    let users = schema.user.cache();

    let jo = users.add(json!({"id": 1, "name": "Jo", "nickname": "J"})).unwrap();
    assert!(!jo.has("nickname"));
    assert_eq!(jo.assigned_fields(), ["id", "name"]);

    assert!(matches!(
        users.add(json!({"id": 1, "age": "old"})),
        Err(CacheError::FieldValue { .. })
    ));
    assert!(matches!(
        users.get(1, &FieldPath::list(["nickname"])),
        Err(CacheError::InvalidField { .. })
    ));
    assert!(matches!(
        users.get(1, &FieldPath::list(["name.first"])),
        Err(CacheError::NotARelation { .. })
    ));
}
