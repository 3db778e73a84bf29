use std::collections::HashSet;

use serde_json::Value;

use crate::schema::{EntitySchema, FieldDescriptor, FieldKind};
use crate::snapshot::{FieldValue, Snapshot};

use super::record::{now_millis, ChangeRecord, FieldChange, UpdateKind};

/// Computes the field-level diff between two snapshots of the same entity,
/// walking the schema's declared fields in order. System-managed fields are
/// skipped, reference collections diff element-wise by identity key, and the
/// version bump is classified from the identity set.
pub fn diff(schema: &EntitySchema, old: &Snapshot, new: &Snapshot) -> ChangeRecord {
    let mut changes = Vec::new();
    let mut major = false;

    for field in schema.fields() {
        if field.system_managed {
            continue;
        }
        let field_changes = diff_field(field, old.field(&field.name), new.field(&field.name));
        if !field_changes.is_empty() && field.identity {
            major = true;
        }
        changes.extend(field_changes);
    }

    let update_kind = if changes.is_empty() {
        UpdateKind::NoChange
    } else if major {
        UpdateKind::Major
    } else {
        UpdateKind::Minor
    };
    let new_version = match update_kind {
        UpdateKind::NoChange => old.version,
        UpdateKind::Minor => old.version.next_minor(),
        UpdateKind::Major => old.version.next_major(),
    };

    ChangeRecord {
        previous_version: old.version,
        new_version,
        update_kind,
        changes,
        updated_at: now_millis(),
    }
}

/// Change record for a freshly created entity: every set field reported as
/// added, both versions pinned to the snapshot's own (initial) version.
pub fn creation(schema: &EntitySchema, snapshot: &Snapshot) -> ChangeRecord {
    let empty = Snapshot::new(snapshot.entity_type.clone(), snapshot.key.clone());
    let mut record = diff(schema, &empty, snapshot);
    record.previous_version = snapshot.version;
    record.new_version = snapshot.version;
    if !record.changes.is_empty() {
        record.update_kind = UpdateKind::Minor;
    }
    record
}

fn diff_field(field: &FieldDescriptor, old: &FieldValue, new: &FieldValue) -> Vec<FieldChange> {
    match field.kind {
        FieldKind::Scalar | FieldKind::Reference => diff_single(field, old, new),
        FieldKind::ReferenceList => diff_collection(field, old, new),
    }
}

fn diff_single(field: &FieldDescriptor, old: &FieldValue, new: &FieldValue) -> Vec<FieldChange> {
    match (old.value(), new.value()) {
        (None, None) => Vec::new(),
        (None, Some(n)) => vec![FieldChange::added(&field.name, n.clone())],
        (Some(o), None) => vec![FieldChange::deleted(&field.name, o.clone())],
        (Some(o), Some(n)) => {
            if o == n {
                Vec::new()
            } else if old.is_default() {
                // A creation-time default replaced by the caller's first
                // concrete value reads as delete-then-add, not as an update
                // of something the caller chose.
                vec![
                    FieldChange::deleted(&field.name, o.clone()),
                    FieldChange::added(&field.name, n.clone()),
                ]
            } else {
                vec![FieldChange::updated(&field.name, o.clone(), n.clone())]
            }
        }
    }
}

fn diff_collection(field: &FieldDescriptor, old: &FieldValue, new: &FieldValue) -> Vec<FieldChange> {
    let old_elements = elements(old);
    let new_elements = elements(new);

    let old_keys: HashSet<String> = old_elements
        .iter()
        .map(|e| element_key(e, &field.key_field))
        .collect();
    let new_keys: HashSet<String> = new_elements
        .iter()
        .map(|e| element_key(e, &field.key_field))
        .collect();

    let added: Vec<Value> = new_elements
        .iter()
        .filter(|e| !old_keys.contains(&element_key(e, &field.key_field)))
        .cloned()
        .collect();
    let removed: Vec<Value> = old_elements
        .iter()
        .filter(|e| !new_keys.contains(&element_key(e, &field.key_field)))
        .cloned()
        .collect();

    let mut changes = Vec::new();
    if !added.is_empty() {
        changes.push(FieldChange::added(&field.name, Value::Array(added)));
    }
    if !removed.is_empty() {
        changes.push(FieldChange::deleted(&field.name, Value::Array(removed)));
    }
    changes
}

fn elements(value: &FieldValue) -> &[Value] {
    value
        .value()
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Identity of one collection element: the element's key field for objects,
/// the element itself otherwise.
pub(crate) fn element_key(element: &Value, key_field: &str) -> String {
    let keyed = match element {
        Value::Object(map) => map.get(key_field),
        _ => None,
    };
    match keyed.unwrap_or(element) {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::record::ChangeKind;
    use serde_json::json;

    fn user_schema() -> EntitySchema {
        EntitySchema::builder("user")
            .scalar("name")
            .identity()
            .scalar("displayName")
            .scalar("email")
            .reference_list("teams")
            .reference_list("roles")
            .scalar("inheritedRoles")
            .system_managed()
            .build()
    }

    fn base_user() -> Snapshot {
        Snapshot::new("user", "alice")
            .with_explicit("name", json!("alice"))
            .with_explicit("email", json!("alice@x.com"))
    }

    #[test]
    fn identical_snapshots_produce_no_change() {
        let schema = user_schema();
        let user = base_user();
        let record = diff(&schema, &user, &user.clone());

        assert!(record.is_no_change());
        assert!(record.changes.is_empty());
        assert_eq!(record.new_version, record.previous_version);
    }

    #[test]
    fn scalar_add_update_delete() {
        let schema = user_schema();
        let old = base_user();

        let added = old.clone().with_explicit("displayName", json!("Alice"));
        let record = diff(&schema, &old, &added);
        assert_eq!(record.changes, vec![FieldChange::added("displayName", json!("Alice"))]);
        assert_eq!(record.update_kind, UpdateKind::Minor);
        assert_eq!(record.new_version, old.version.next_minor());

        let updated = added.clone().with_explicit("displayName", json!("Alice B"));
        let record = diff(&schema, &added, &updated);
        assert_eq!(
            record.changes,
            vec![FieldChange::updated("displayName", json!("Alice"), json!("Alice B"))]
        );

        let mut deleted = updated.clone();
        deleted.set_field("displayName", FieldValue::Unset);
        let record = diff(&schema, &updated, &deleted);
        assert_eq!(
            record.changes,
            vec![FieldChange::deleted("displayName", json!("Alice B"))]
        );
    }

    #[test]
    fn identity_field_change_is_major() {
        let schema = user_schema();
        let old = base_user();
        let renamed = old.clone().with_explicit("name", json!("alicia"));

        let record = diff(&schema, &old, &renamed);
        assert_eq!(record.update_kind, UpdateKind::Major);
        assert_eq!(record.new_version, old.version.next_major());
    }

    #[test]
    fn collection_diff_is_element_wise() {
        let schema = user_schema();
        let old = base_user().with_explicit("teams", json!([{"name": "t1"}, {"name": "t2"}]));
        let new = base_user().with_explicit("teams", json!([{"name": "t2"}, {"name": "t3"}]));

        let record = diff(&schema, &old, &new);
        assert_eq!(
            record.changes,
            vec![
                FieldChange::added("teams", json!([{"name": "t3"}])),
                FieldChange::deleted("teams", json!([{"name": "t1"}])),
            ]
        );
    }

    #[test]
    fn collection_element_identity_ignores_non_key_content() {
        let schema = user_schema();
        let old = base_user().with_explicit("teams", json!([{"name": "t1", "description": "a"}]));
        let new = base_user().with_explicit("teams", json!([{"name": "t1", "description": "b"}]));

        let record = diff(&schema, &old, &new);
        assert!(record.is_no_change());
    }

    #[test]
    fn system_managed_fields_are_not_diffed() {
        let schema = user_schema();
        let old = base_user().with_explicit("inheritedRoles", json!([{"name": "r1"}]));
        let new = base_user().with_explicit("inheritedRoles", json!([{"name": "r2"}]));

        let record = diff(&schema, &old, &new);
        assert!(record.is_no_change());
    }

    #[test]
    fn default_replaced_by_explicit_reads_as_delete_then_add() {
        let schema = user_schema();
        let old = base_user().with_default("teams", json!([{"name": "org"}]));
        let new = base_user().with_explicit("teams", json!([{"name": "t1"}]));

        let record = diff(&schema, &old, &new);
        assert_eq!(
            record.changes,
            vec![
                FieldChange::added("teams", json!([{"name": "t1"}])),
                FieldChange::deleted("teams", json!([{"name": "org"}])),
            ]
        );
    }

    #[test]
    fn default_scalar_replaced_by_explicit_is_delete_plus_add() {
        let schema = user_schema();
        let old = base_user().with_default("displayName", json!("generated"));
        let new = base_user().with_explicit("displayName", json!("chosen"));

        let record = diff(&schema, &old, &new);
        assert_eq!(
            record.changes,
            vec![
                FieldChange::deleted("displayName", json!("generated")),
                FieldChange::added("displayName", json!("chosen")),
            ]
        );
    }

    #[test]
    fn default_confirmed_with_same_value_is_no_change() {
        let schema = user_schema();
        let old = base_user().with_default("teams", json!([{"name": "org"}]));
        let new = base_user().with_explicit("teams", json!([{"name": "org"}]));

        let record = diff(&schema, &old, &new);
        assert!(record.is_no_change());
    }

    #[test]
    fn creation_record_reports_every_set_field_as_added() {
        let schema = user_schema();
        let user = base_user().with_explicit("teams", json!([{"name": "t1"}]));

        let record = creation(&schema, &user);
        assert_eq!(record.update_kind, UpdateKind::Minor);
        assert_eq!(record.previous_version, user.version);
        assert_eq!(record.new_version, user.version);
        assert!(record
            .changes
            .iter()
            .all(|c| c.kind == ChangeKind::Added));
        let fields: Vec<&str> = record.changes.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["name", "email", "teams"]);
    }
}
