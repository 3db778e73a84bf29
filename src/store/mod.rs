pub mod memory;

pub use memory::MemoryStore;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::change::ChangeRecord;
use crate::error::Result;
use crate::snapshot::{EntityVersion, Snapshot};

/// Lightweight pointer to another entity, the element type of
/// reference-collection fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityReference {
    pub entity_type: String,
    pub name: String,
}

impl EntityReference {
    pub fn new(entity_type: impl Into<String>, name: impl Into<String>) -> Self {
        EntityReference {
            entity_type: entity_type.into(),
            name: name.into(),
        }
    }
}

/// The principal on whose behalf a mutation runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub principal: String,
}

impl Caller {
    pub fn new(principal: impl Into<String>) -> Self {
        Caller {
            principal: principal.into(),
        }
    }
}

/// Backing store for entity snapshots. The engine treats every call as
/// independently failable; the single-entity commit is the only place that
/// needs transactional discipline.
pub trait Persistence: Send + Sync {
    fn load(&self, entity_type: &str, key: &str) -> Result<Option<Snapshot>>;

    /// Commits a snapshot. `expected_version` of `None` means create (the
    /// entity must not exist yet); `Some` is an optimistic check against the
    /// stored version. A mismatch is reported as `EngineError::Conflict`.
    fn commit(&self, snapshot: &Snapshot, expected_version: Option<EntityVersion>) -> Result<()>;

    /// All snapshots of one entity type, ordered by key.
    fn list(&self, entity_type: &str) -> Result<Vec<Snapshot>>;
}

/// Field-level permission check, delegated to the embedding system.
pub trait Authorization: Send + Sync {
    /// Returns the subset of `fields` the caller is allowed to modify.
    fn can_modify_fields(
        &self,
        caller: &Caller,
        entity_type: &str,
        fields: &[String],
    ) -> Result<Vec<String>>;
}

/// Foreign-key lookups for bulk validation.
pub trait ReferenceResolver: Send + Sync {
    fn resolve(&self, entity_type: &str, name: &str) -> Result<Option<EntityReference>>;

    /// Whether `reference` falls inside the sub-hierarchy rooted at `scope`.
    fn in_scope(&self, reference: &EntityReference, scope: &EntityReference) -> Result<bool>;
}

/// Storage for per-entity change records.
pub trait ChangeHistoryStore: Send + Sync {
    fn last_record(&self, entity_type: &str, key: &str) -> Result<Option<ChangeRecord>>;

    /// Appends a record. A record carrying the same `new_version` as the
    /// stored tail replaces it; that is how a consolidated record supersedes
    /// the one it merged with.
    fn append(&self, entity_type: &str, key: &str, record: &ChangeRecord) -> Result<()>;
}

/// Authorization that lets every caller modify every field.
#[derive(Clone, Debug, Default)]
pub struct PermitAll;

impl Authorization for PermitAll {
    fn can_modify_fields(
        &self,
        _caller: &Caller,
        _entity_type: &str,
        fields: &[String],
    ) -> Result<Vec<String>> {
        Ok(fields.to_vec())
    }
}

/// Authorization that reserves a set of fields for admin principals.
/// Non-admin callers get those fields filtered out of the allowed subset.
#[derive(Clone, Debug, Default)]
pub struct ProtectedFields {
    protected: HashSet<String>,
    admins: HashSet<String>,
}

impl ProtectedFields {
    pub fn new(
        protected: impl IntoIterator<Item = impl Into<String>>,
        admins: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        ProtectedFields {
            protected: protected.into_iter().map(Into::into).collect(),
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorization for ProtectedFields {
    fn can_modify_fields(
        &self,
        caller: &Caller,
        _entity_type: &str,
        fields: &[String],
    ) -> Result<Vec<String>> {
        if self.admins.contains(&caller.principal) {
            return Ok(fields.to_vec());
        }
        Ok(fields
            .iter()
            .filter(|f| !self.protected.contains(*f))
            .cloned()
            .collect())
    }
}
