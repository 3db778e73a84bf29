use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::EntityVersion;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// One field-level change between two snapshots. Reference-list fields carry
/// the array of added or removed elements, never the whole collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl FieldChange {
    pub fn added(field: impl Into<String>, new_value: Value) -> Self {
        FieldChange {
            field: field.into(),
            kind: ChangeKind::Added,
            old_value: None,
            new_value: Some(new_value),
        }
    }

    pub fn updated(field: impl Into<String>, old_value: Value, new_value: Value) -> Self {
        FieldChange {
            field: field.into(),
            kind: ChangeKind::Updated,
            old_value: Some(old_value),
            new_value: Some(new_value),
        }
    }

    pub fn deleted(field: impl Into<String>, old_value: Value) -> Self {
        FieldChange {
            field: field.into(),
            kind: ChangeKind::Deleted,
            old_value: Some(old_value),
            new_value: None,
        }
    }
}

/// Classification of an update, driven by which fields changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    NoChange,
    Minor,
    Major,
}

/// Ordered field-level diff between two consecutive versions of an entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub previous_version: EntityVersion,
    pub new_version: EntityVersion,
    pub update_kind: UpdateKind,
    pub changes: Vec<FieldChange>,
    /// Epoch millis of the patch that produced (or last consolidated into)
    /// this record.
    pub updated_at: i64,
}

impl ChangeRecord {
    pub fn no_change(version: EntityVersion) -> Self {
        ChangeRecord {
            previous_version: version,
            new_version: version,
            update_kind: UpdateKind::NoChange,
            changes: Vec::new(),
            updated_at: now_millis(),
        }
    }

    pub fn is_no_change(&self) -> bool {
        self.update_kind == UpdateKind::NoChange
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
