use serde_json::Value;

use crate::schema::{EntitySchema, FieldDescriptor, FieldKind};

use super::record::{ChangeKind, ChangeRecord, FieldChange, UpdateKind};
use super::recorder::element_key;

/// Merges a follow-up diff into the change record already stored for the
/// same version. Per field: an add followed by a delete cancels out, update
/// chains collapse to one update from the original old value to the final
/// new value, and collection adds/removes merge into net element sets. A
/// field deleted and later re-added with a different value stays a
/// delete+add pair.
///
/// Consolidation keeps the stored record's version pair; merging is
/// associative for disjoint field sets.
pub fn consolidate(
    schema: &EntitySchema,
    last: &ChangeRecord,
    fresh: &ChangeRecord,
) -> ChangeRecord {
    let mut changes = Vec::new();

    for field in schema.fields() {
        if field.system_managed {
            continue;
        }
        let last_changes: Vec<&FieldChange> = field_changes(last, &field.name);
        let fresh_changes: Vec<&FieldChange> = field_changes(fresh, &field.name);
        if last_changes.is_empty() && fresh_changes.is_empty() {
            continue;
        }
        match field.kind {
            FieldKind::Scalar | FieldKind::Reference => {
                changes.extend(merge_single(field, &last_changes, &fresh_changes));
            }
            FieldKind::ReferenceList => {
                changes.extend(merge_collection(field, &last_changes, &fresh_changes));
            }
        }
    }

    let update_kind = if changes.is_empty() {
        UpdateKind::NoChange
    } else {
        last.update_kind.max(fresh.update_kind)
    };

    ChangeRecord {
        previous_version: last.previous_version,
        new_version: last.new_version,
        update_kind,
        changes,
        updated_at: fresh.updated_at,
    }
}

fn field_changes<'a>(record: &'a ChangeRecord, field: &str) -> Vec<&'a FieldChange> {
    record.changes.iter().filter(|c| c.field == field).collect()
}

/// Net effect of one record's changes to a single-valued field: the value at
/// the record's base version, the value after the record, and whether the
/// record represented it as an explicit delete+add pair.
fn single_net(changes: &[&FieldChange]) -> (Option<Value>, Option<Value>, bool) {
    match changes {
        [] => (None, None, false),
        [only] => match only.kind {
            ChangeKind::Added => (None, only.new_value.clone(), false),
            ChangeKind::Updated => (only.old_value.clone(), only.new_value.clone(), false),
            ChangeKind::Deleted => (only.old_value.clone(), None, false),
        },
        [first, .., final_change] => (
            first.old_value.clone(),
            final_change.new_value.clone(),
            first.kind == ChangeKind::Deleted && final_change.kind == ChangeKind::Added,
        ),
    }
}

fn merge_single(
    field: &FieldDescriptor,
    last: &[&FieldChange],
    fresh: &[&FieldChange],
) -> Vec<FieldChange> {
    if fresh.is_empty() {
        return last.iter().map(|c| (*c).clone()).collect();
    }
    if last.is_empty() {
        return fresh.iter().map(|c| (*c).clone()).collect();
    }

    let (base_old, last_new, last_pair) = single_net(last);
    let (_, final_new, fresh_pair) = single_net(fresh);
    let deleted_in_between = last_new.is_none();

    match (base_old, final_new) {
        (None, None) => Vec::new(),
        (None, Some(value)) => vec![FieldChange::added(&field.name, value)],
        (Some(original), None) => vec![FieldChange::deleted(&field.name, original)],
        (Some(original), Some(value)) => {
            if original == value {
                Vec::new()
            } else if last_pair || fresh_pair || deleted_in_between {
                vec![
                    FieldChange::deleted(&field.name, original),
                    FieldChange::added(&field.name, value),
                ]
            } else {
                vec![FieldChange::updated(&field.name, original, value)]
            }
        }
    }
}

fn collection_net(changes: &[&FieldChange]) -> (Vec<Value>, Vec<Value>) {
    let mut added = Vec::new();
    let mut deleted = Vec::new();
    for change in changes {
        match change.kind {
            ChangeKind::Added => {
                if let Some(Value::Array(elements)) = &change.new_value {
                    added.extend(elements.iter().cloned());
                }
            }
            ChangeKind::Deleted => {
                if let Some(Value::Array(elements)) = &change.old_value {
                    deleted.extend(elements.iter().cloned());
                }
            }
            ChangeKind::Updated => {}
        }
    }
    (added, deleted)
}

fn merge_collection(
    field: &FieldDescriptor,
    last: &[&FieldChange],
    fresh: &[&FieldChange],
) -> Vec<FieldChange> {
    let (mut net_added, mut net_deleted) = collection_net(last);
    let (fresh_added, fresh_deleted) = collection_net(fresh);
    let key = |e: &Value| element_key(e, &field.key_field);

    for element in fresh_deleted {
        let element_id = key(&element);
        if net_added.iter().any(|e| key(e) == element_id) {
            // Added earlier in the same version, removed again: cancels.
            net_added.retain(|e| key(e) != element_id);
        } else if !net_deleted.iter().any(|e| key(e) == element_id) {
            net_deleted.push(element);
        }
    }
    for element in fresh_added {
        let element_id = key(&element);
        if net_deleted.iter().any(|e| key(e) == element_id) {
            // Removed earlier in the same version, put back: cancels.
            net_deleted.retain(|e| key(e) != element_id);
        } else if !net_added.iter().any(|e| key(e) == element_id) {
            net_added.push(element);
        }
    }

    let mut changes = Vec::new();
    if !net_added.is_empty() {
        changes.push(FieldChange::added(&field.name, Value::Array(net_added)));
    }
    if !net_deleted.is_empty() {
        changes.push(FieldChange::deleted(&field.name, Value::Array(net_deleted)));
    }
    changes
}
