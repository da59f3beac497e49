use serde_json::{json, Value};
use viewmodel_cache::prelude::*;
use viewmodel_cache::test::{change_recorder, text, TestSchema};

#[test]
fn nested_data_lands_in_related_caches() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let fields = FieldPath::list(["name", "group.name"]);

    let user = users
        .add(json!({"id": 1, "name": "Jo", "group": {"id": 10, "name": "Admins"}}))
        .unwrap();
    assert_eq!(user.value("groupId"), Some(&json!(10)));

    let group = schema
        .group
        .cache()
        .get(10, &FieldPath::list(["name"]))
        .unwrap()
        .unwrap();
    assert_eq!(text(&group, "name"), "Admins");

    let view = users.get(1, &fields).unwrap().unwrap();
    assert!(view.ptr_eq(&user));
    assert_eq!(text(view.related("group").unwrap(), "name"), "Admins");
}

#[test]
fn relation_value_overrides_source_field() {
    let schema = TestSchema::new();
    let user = schema
        .user
        .cache()
        .add(json!({"id": 1, "groupId": 5, "group": {"id": 6, "name": "Six"}}))
        .unwrap();
    assert_eq!(user.value("groupId"), Some(&json!(6)));
}

#[test]
fn views_are_joined_from_related_caches() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let groups = schema.group.cache();

    groups.add(json!({"id": 1, "name": "X", "ownerId": null})).unwrap();
    users.add(json!({"id": 1, "groupId": 1})).unwrap();

    let joined = users.get(1, &FieldPath::list(["group"])).unwrap().unwrap();
    let group = joined.related("group").unwrap();
    assert_eq!(text(group, "name"), "X");
    assert_eq!(group.value("ownerId"), Some(&Value::Null));
    assert!(!group.has("owner"));

    // Reading again returns the stored join.
    assert!(users
        .get(1, &FieldPath::list(["group"]))
        .unwrap()
        .unwrap()
        .ptr_eq(&joined));
}

#[test]
fn deleting_a_related_record_cascades() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let groups = schema.group.cache();
    let fields = FieldPath::list(["group"]);

    groups.add(json!({"id": 1, "name": "X", "ownerId": null})).unwrap();
    users.add(json!({"id": 1, "groupId": 1})).unwrap();
    let joined = users.get(1, &fields).unwrap().unwrap();

    let (listener, calls) = change_recorder();
    let _unsubscribe = users.add_listener(Listen::record(1, fields.clone(), listener)).unwrap();

    assert!(groups.delete(1, None).unwrap());
    assert!(users.get(1, &fields).unwrap().is_none());
    {
        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.as_ref().unwrap().ptr_eq(&joined));
        assert!(calls[0].1.is_none());
    }

    // The user itself is still there.
    assert!(users.get(1, &FieldPath::list(["groupId"])).unwrap().is_some());

    // The listened view comes back with the related record.
    groups.add(json!({"id": 1, "name": "Y", "ownerId": null})).unwrap();
    let back = users.get(1, &fields).unwrap().unwrap();
    assert_eq!(text(back.related("group").unwrap(), "name"), "Y");
    let calls = calls.borrow();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].0.is_none());
    assert!(calls[1].1.as_ref().unwrap().ptr_eq(&back));
}

#[test]
fn related_updates_reach_listeners() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let groups = schema.group.cache();
    let fields = FieldPath::list(["name", "group.name"]);

    users
        .add(json!({"id": 1, "name": "Jo", "group": {"id": 10, "name": "Admins"}}))
        .unwrap();
    let (listener, calls) = change_recorder();
    let _unsubscribe = users.add_listener(Listen::record(1, fields.clone(), listener)).unwrap();

    groups.add(json!({"id": 10, "name": "Staff"})).unwrap();

    let view = users.get(1, &fields).unwrap().unwrap();
    assert_eq!(text(view.related("group").unwrap(), "name"), "Staff");
    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert_eq!(text(calls[0].0.as_ref().unwrap().related("group").unwrap(), "name"), "Admins");
    assert!(calls[0].1.as_ref().unwrap().ptr_eq(&view));
}

#[test]
fn switching_relation_follows_the_new_target() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let groups = schema.group.cache();
    let fields = FieldPath::list(["name", "group.name"]);

    groups
        .add_list([json!({"id": 1, "name": "One"}), json!({"id": 2, "name": "Two"})])
        .unwrap();
    users.add(json!({"id": 1, "name": "Jo", "groupId": 1})).unwrap();
    assert_eq!(
        text(users.get(1, &fields).unwrap().unwrap().related("group").unwrap(), "name"),
        "One"
    );

    users.add(json!({"id": 1, "name": "Jo", "groupId": 2})).unwrap();
    assert_eq!(
        text(users.get(1, &fields).unwrap().unwrap().related("group").unwrap(), "name"),
        "Two"
    );

    // The old target no longer matters to the user.
    groups.delete(1, None).unwrap();
    assert!(users.get(1, &fields).unwrap().is_some());
}

#[test]
fn switching_to_an_uncached_target_waits_for_it() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let groups = schema.group.cache();
    let fields = FieldPath::list(["name", "group.name"]);

    groups.add(json!({"id": 1, "name": "One"})).unwrap();
    users.add(json!({"id": 2, "name": "Jo", "groupId": 1})).unwrap();
    let (listener, calls) = change_recorder();
    let _unsubscribe = users.add_listener(Listen::record(2, fields.clone(), listener)).unwrap();

    users.add(json!({"id": 2, "name": "Jo", "groupId": 2})).unwrap();
    assert!(users.get(2, &fields).unwrap().is_none());
    {
        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(text(calls[0].0.as_ref().unwrap().related("group").unwrap(), "name"), "One");
        assert!(calls[0].1.is_none());
    }

    // The old target is no longer watched.
    groups.add(json!({"id": 1, "name": "Uno"})).unwrap();
    assert_eq!(calls.borrow().len(), 1);

    groups.add(json!({"id": 2, "name": "Two"})).unwrap();
    let view = users.get(2, &fields).unwrap().unwrap();
    assert_eq!(view.value("groupId"), Some(&json!(2)));
    assert_eq!(text(view.related("group").unwrap(), "name"), "Two");
    let calls = calls.borrow();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].0.is_none());
    assert!(calls[1].1.as_ref().unwrap().ptr_eq(&view));
}

#[test]
fn related_record_arriving_later_reaches_listeners() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let groups = schema.group.cache();
    let fields = FieldPath::list(["name", "group.name"]);

    let (listener, calls) = change_recorder();
    let _unsubscribe = users.add_listener(Listen::record(1, fields.clone(), listener)).unwrap();

    users.add(json!({"id": 1, "name": "Jo", "groupId": 100})).unwrap();
    assert!(users.get(1, &fields).unwrap().is_none());
    assert!(calls.borrow().is_empty());

    groups.add(json!({"id": 100, "name": "Hundred"})).unwrap();
    let view = users.get(1, &fields).unwrap().unwrap();
    assert_eq!(text(view.related("group").unwrap(), "name"), "Hundred");
    let calls = calls.borrow();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0.is_none());
    assert!(calls[0].1.as_ref().unwrap().ptr_eq(&view));
}

#[test]
fn null_relations_are_values() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let fields = FieldPath::list(["name", "group.name"]);

    users.add(json!({"id": 2, "name": "Solo", "group": null})).unwrap();
    let view = users.get(2, &fields).unwrap().unwrap();
    assert!(view.related("group").is_none());
    assert_eq!(view.value("groupId"), Some(&Value::Null));

    users.add(json!({"id": 3, "name": "Nobody", "groupId": null})).unwrap();
    let view = users.get(3, &fields).unwrap().unwrap();
    assert!(view.related("group").is_none());
    assert_eq!(text(&view, "name"), "Nobody");
}

#[test]
fn unresolvable_relations_are_not_found() {
    let schema = TestSchema::new();
    let users = schema.user.cache();

    users.add(json!({"id": 1, "name": "Jo", "groupId": 99})).unwrap();
    assert!(users
        .get(1, &FieldPath::list(["name", "group.name"]))
        .unwrap()
        .is_none());
}

#[test]
fn many_relations_join_every_record() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let tags = schema.tag.cache();
    let fields = FieldPath::list(["name", "tags.label"]);

    tags.add_list([json!({"id": 1, "label": "a"}), json!({"id": 2, "label": "b"})])
        .unwrap();
    users.add(json!({"id": 1, "name": "Jo", "tagIds": [2, 1]})).unwrap();

    let view = users.get(1, &fields).unwrap().unwrap();
    let labels = view
        .related_many("tags")
        .unwrap()
        .iter()
        .map(|tag| text(tag, "label"))
        .collect::<Vec<_>>();
    assert_eq!(labels, ["b", "a"]);

    tags.delete(2, None).unwrap();
    assert!(users.get(1, &fields).unwrap().is_none());

    let nested = users
        .add(json!({"id": 5, "name": "Kim", "tags": [{"id": 3, "label": "c"}]}))
        .unwrap();
    assert_eq!(nested.value("tagIds"), Some(&json!([3])));
    assert!(tags.get(3, &FieldPath::list(["label"])).unwrap().is_some());
    assert_eq!(users.get(5, &fields).unwrap().unwrap().related_many("tags").unwrap().len(), 1);
}

#[test]
fn invalid_ids_in_a_many_relation_are_misses() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let tags = schema.tag.cache();
    let fields = FieldPath::list(["name", "tags.label"]);

    tags.add(json!({"id": 1, "label": "a"})).unwrap();
    users.add(json!({"id": 1, "name": "Jo", "tagIds": [1, null]})).unwrap();
    assert!(users.get(1, &fields).unwrap().is_none());

    let (listener, calls) = change_recorder();
    let unsubscribe = users.add_listener(Listen::record(1, fields.clone(), listener)).unwrap();
    users.add(json!({"id": 1, "name": "Kim", "tagIds": [1, null]})).unwrap();
    assert!(users.get(1, &fields).unwrap().is_none());
    assert!(calls.borrow().is_empty());

    users.add(json!({"id": 1, "name": "Kim", "tagIds": [1]})).unwrap();
    let view = users.get(1, &fields).unwrap().unwrap();
    assert_eq!(view.related_many("tags").unwrap().len(), 1);
    assert_eq!(calls.borrow().len(), 1);
    unsubscribe.unsubscribe();
}

#[test]
fn cyclic_relations_resolve() {
    let schema = TestSchema::new();
    let users = schema.user.cache();
    let groups = schema.group.cache();

    users.add(json!({"id": 1, "name": "Jo", "groupId": 10})).unwrap();
    groups
        .add(json!({"id": 10, "name": "Admins", "owner": {"id": 1, "name": "Jo"}}))
        .unwrap();

    let view = users
        .get(1, &FieldPath::list(["name", "group.owner.name"]))
        .unwrap()
        .unwrap();
    let owner = view.related("group").and_then(|group| group.related("owner")).unwrap();
    assert_eq!(text(owner, "name"), "Jo");

    // A wildcard request stops where the relations loop back.
    let everything = schema.user.field_set(&FieldPath::all()).unwrap();
    assert!(everything.contains("group.owner.name"));
    assert!(!everything.contains("group.owner.group.name"));
}
