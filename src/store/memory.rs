use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::change::ChangeRecord;
use crate::error::{EngineError, Result};
use crate::snapshot::{EntityVersion, Snapshot};
use crate::store::{ChangeHistoryStore, EntityReference, Persistence, ReferenceResolver};

type Key = (String, String);

/// Process-local store implementing every storage-side collaborator, for
/// embedding and tests. Reference entities (teams, roles, ...) are
/// registered with an optional parent so scope checks can walk the
/// hierarchy.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entities: Arc<RwLock<HashMap<Key, Snapshot>>>,
    history: Arc<RwLock<HashMap<Key, Vec<ChangeRecord>>>>,
    references: Arc<RwLock<HashMap<Key, Option<String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resolvable reference entity, optionally under a parent of
    /// the same type.
    pub fn add_reference(&self, entity_type: &str, name: &str, parent: Option<&str>) -> Result<()> {
        let mut references = self
            .references
            .write()
            .map_err(|_| EngineError::internal("failed to acquire write lock"))?;
        references.insert(
            (entity_type.to_string(), name.to_string()),
            parent.map(|p| p.to_string()),
        );
        Ok(())
    }

    /// Change records stored for one entity, oldest first.
    pub fn records(&self, entity_type: &str, key: &str) -> Result<Vec<ChangeRecord>> {
        let history = self
            .history
            .read()
            .map_err(|_| EngineError::internal("failed to acquire read lock"))?;
        Ok(history
            .get(&(entity_type.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

impl Persistence for MemoryStore {
    fn load(&self, entity_type: &str, key: &str) -> Result<Option<Snapshot>> {
        let entities = self
            .entities
            .read()
            .map_err(|_| EngineError::internal("failed to acquire read lock"))?;
        Ok(entities
            .get(&(entity_type.to_string(), key.to_string()))
            .cloned())
    }

    fn commit(&self, snapshot: &Snapshot, expected_version: Option<EntityVersion>) -> Result<()> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| EngineError::internal("failed to acquire write lock"))?;
        let key = (snapshot.entity_type.clone(), snapshot.key.clone());

        match (entities.get(&key), expected_version) {
            (Some(_), None) => {
                return Err(EngineError::conflict(&snapshot.entity_type, &snapshot.key))
            }
            (None, Some(_)) => {
                return Err(EngineError::not_found(&snapshot.entity_type, &snapshot.key))
            }
            (Some(current), Some(expected)) if current.version != expected => {
                log::warn!(
                    "commit conflict on {} '{}': expected {}, stored {}",
                    snapshot.entity_type,
                    snapshot.key,
                    expected,
                    current.version
                );
                return Err(EngineError::conflict(&snapshot.entity_type, &snapshot.key));
            }
            _ => {}
        }

        log::debug!(
            "commit {} '{}' at version {}",
            snapshot.entity_type,
            snapshot.key,
            snapshot.version
        );
        entities.insert(key, snapshot.clone());
        Ok(())
    }

    fn list(&self, entity_type: &str) -> Result<Vec<Snapshot>> {
        let entities = self
            .entities
            .read()
            .map_err(|_| EngineError::internal("failed to acquire read lock"))?;
        let mut snapshots: Vec<Snapshot> = entities
            .values()
            .filter(|s| s.entity_type == entity_type)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(snapshots)
    }
}

impl ChangeHistoryStore for MemoryStore {
    fn last_record(&self, entity_type: &str, key: &str) -> Result<Option<ChangeRecord>> {
        let history = self
            .history
            .read()
            .map_err(|_| EngineError::internal("failed to acquire read lock"))?;
        Ok(history
            .get(&(entity_type.to_string(), key.to_string()))
            .and_then(|records| records.last().cloned()))
    }

    fn append(&self, entity_type: &str, key: &str, record: &ChangeRecord) -> Result<()> {
        let mut history = self
            .history
            .write()
            .map_err(|_| EngineError::internal("failed to acquire write lock"))?;
        let records = history
            .entry((entity_type.to_string(), key.to_string()))
            .or_default();
        match records.last_mut() {
            Some(last) if last.new_version == record.new_version => {
                *last = record.clone();
            }
            _ => records.push(record.clone()),
        }
        Ok(())
    }
}

impl ReferenceResolver for MemoryStore {
    fn resolve(&self, entity_type: &str, name: &str) -> Result<Option<EntityReference>> {
        let key = (entity_type.to_string(), name.to_string());
        let registered = {
            let references = self
                .references
                .read()
                .map_err(|_| EngineError::internal("failed to acquire read lock"))?;
            references.contains_key(&key)
        };
        let stored = {
            let entities = self
                .entities
                .read()
                .map_err(|_| EngineError::internal("failed to acquire read lock"))?;
            entities.contains_key(&key)
        };
        log::debug!(
            "resolve {} '{}': registered={} stored={}",
            entity_type,
            name,
            registered,
            stored
        );
        if registered || stored {
            Ok(Some(EntityReference::new(entity_type, name)))
        } else {
            Ok(None)
        }
    }

    fn in_scope(&self, reference: &EntityReference, scope: &EntityReference) -> Result<bool> {
        if reference.entity_type != scope.entity_type {
            return Ok(false);
        }
        let references = self
            .references
            .read()
            .map_err(|_| EngineError::internal("failed to acquire read lock"))?;

        let mut current = Some(reference.name.clone());
        let mut hops = 0;
        while let Some(name) = current {
            if name == scope.name {
                return Ok(true);
            }
            // Guard against a cyclic parent registration.
            hops += 1;
            if hops > references.len() + 1 {
                return Ok(false);
            }
            current = references
                .get(&(reference.entity_type.clone(), name))
                .cloned()
                .flatten();
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::record::UpdateKind;
    use serde_json::json;

    #[test]
    fn create_then_update_with_version_check() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let snapshot = Snapshot::new("user", "alice").with_explicit("name", json!("alice"));

        store.commit(&snapshot, None)?;
        assert!(store.load("user", "alice")?.is_some());

        // Creating again conflicts.
        assert!(matches!(
            store.commit(&snapshot, None),
            Err(EngineError::Conflict { .. })
        ));

        // Stale expected version conflicts.
        let updated = snapshot
            .clone()
            .with_version(snapshot.version.next_minor());
        assert!(matches!(
            store.commit(&updated, Some(EntityVersion { major: 3, minor: 0 })),
            Err(EngineError::Conflict { .. })
        ));

        store.commit(&updated, Some(snapshot.version))?;
        assert_eq!(store.load("user", "alice")?.unwrap().version, updated.version);
        Ok(())
    }

    #[test]
    fn update_of_missing_entity_is_not_found() {
        let store = MemoryStore::new();
        let snapshot = Snapshot::new("user", "ghost");
        assert!(matches!(
            store.commit(&snapshot, Some(EntityVersion::INITIAL)),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn list_is_sorted_and_type_scoped() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.commit(&Snapshot::new("user", "bob"), None)?;
        store.commit(&Snapshot::new("user", "alice"), None)?;
        store.commit(&Snapshot::new("team", "t1"), None)?;

        let users = store.list("user")?;
        let keys: Vec<&str> = users.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["alice", "bob"]);
        Ok(())
    }

    #[test]
    fn append_replaces_record_with_same_new_version() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let mut record = ChangeRecord::no_change(EntityVersion::INITIAL);
        record.update_kind = UpdateKind::Minor;
        record.new_version = EntityVersion::INITIAL.next_minor();

        store.append("user", "alice", &record)?;
        let mut consolidated = record.clone();
        consolidated.updated_at += 1;
        store.append("user", "alice", &consolidated)?;

        assert_eq!(store.records("user", "alice")?.len(), 1);
        assert_eq!(
            store.last_record("user", "alice")?.unwrap().updated_at,
            consolidated.updated_at
        );

        let mut next = record.clone();
        next.previous_version = record.new_version;
        next.new_version = record.new_version.next_minor();
        store.append("user", "alice", &next)?;
        assert_eq!(store.records("user", "alice")?.len(), 2);
        Ok(())
    }

    #[test]
    fn scope_walks_the_parent_chain() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.add_reference("team", "org", None)?;
        store.add_reference("team", "division", Some("org"))?;
        store.add_reference("team", "group", Some("division"))?;
        store.add_reference("team", "other", Some("org"))?;

        let group = EntityReference::new("team", "group");
        assert!(store.in_scope(&group, &EntityReference::new("team", "division"))?);
        assert!(store.in_scope(&group, &EntityReference::new("team", "org"))?);
        assert!(store.in_scope(&group, &EntityReference::new("team", "group"))?);
        assert!(!store.in_scope(&group, &EntityReference::new("team", "other"))?);
        assert!(!store.in_scope(&group, &EntityReference::new("role", "org"))?);
        Ok(())
    }

    #[test]
    fn resolve_sees_registered_references_and_stored_entities() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.add_reference("team", "t1", None)?;
        store.commit(&Snapshot::new("user", "alice"), None)?;

        assert!(store.resolve("team", "t1")?.is_some());
        assert!(store.resolve("user", "alice")?.is_some());
        assert!(store.resolve("team", "missing")?.is_none());
        Ok(())
    }
}
