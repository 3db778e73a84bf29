use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tagged state of a single entity field. `Default` marks a value the system
/// applied at creation time (for example the root organization membership) so
/// that a later caller-chosen value can be told apart from an edit of
/// something the caller picked themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Unset,
    Default(Value),
    Explicit(Value),
}

impl FieldValue {
    /// The underlying value regardless of how it was assigned.
    pub fn value(&self) -> Option<&Value> {
        match self {
            FieldValue::Unset => None,
            FieldValue::Default(v) | FieldValue::Explicit(v) => Some(v),
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, FieldValue::Unset)
    }

    pub fn is_default(&self) -> bool {
        matches!(self, FieldValue::Default(_))
    }
}

/// Monotonically increasing entity version. Minor bumps increment the second
/// component, major bumps increment the first and reset the second, rendered
/// as `major.minor` (`0.1`, `0.2`, `1.0`, ...).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityVersion {
    pub major: u32,
    pub minor: u32,
}

impl EntityVersion {
    /// Version assigned to a freshly created entity.
    pub const INITIAL: EntityVersion = EntityVersion { major: 0, minor: 1 };

    pub fn next_minor(self) -> Self {
        EntityVersion {
            major: self.major,
            minor: self.minor + 1,
        }
    }

    pub fn next_major(self) -> Self {
        EntityVersion {
            major: self.major + 1,
            minor: 0,
        }
    }
}

impl fmt::Display for EntityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

static UNSET: FieldValue = FieldValue::Unset;

/// Immutable full field-value state of one entity at a version. The engine
/// never mutates a persisted snapshot in place; it compares snapshots and
/// produces new ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entity_type: String,
    pub key: String,
    pub version: EntityVersion,
    fields: BTreeMap<String, FieldValue>,
}

impl Snapshot {
    pub fn new(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Snapshot {
            entity_type: entity_type.into(),
            key: key.into(),
            version: EntityVersion::INITIAL,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(&self, name: &str) -> &FieldValue {
        self.fields.get(name).unwrap_or(&UNSET)
    }

    /// Shortcut for the raw value of a field, unset or not.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.field(name).value()
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        match value {
            FieldValue::Unset => {
                self.fields.remove(&name);
            }
            other => {
                self.fields.insert(name, other);
            }
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn with_explicit(self, name: impl Into<String>, value: Value) -> Self {
        self.with_field(name, FieldValue::Explicit(value))
    }

    pub fn with_default(self, name: impl Into<String>, value: Value) -> Self {
        self.with_field(name, FieldValue::Default(value))
    }

    pub fn with_version(mut self, version: EntityVersion) -> Self {
        self.version = version;
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }
}
