use serde_json::json;
use vellum::change::{ChangeKind, FieldChange, UpdateKind};
use vellum::schema::EntitySchema;
use vellum::snapshot::{EntityVersion, Snapshot};
use vellum::store::{Caller, MemoryStore, Persistence};
use vellum::CatalogEngine;

fn user_schema() -> EntitySchema {
    EntitySchema::builder("user")
        .scalar("name")
        .identity()
        .scalar("displayName")
        .scalar("timezone")
        .reference_list("teams")
        .reference_list("roles")
        .build()
}

fn engine() -> (CatalogEngine, MemoryStore) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = MemoryStore::new();
    let engine = CatalogEngine::builder()
        .memory_store(store.clone())
        .register(user_schema())
        .build()
        .unwrap();
    (engine, store)
}

fn alice() -> Snapshot {
    Snapshot::new("user", "alice").with_explicit("name", json!("alice"))
}

#[test]
fn same_session_role_additions_consolidate() -> anyhow::Result<()> {
    let (engine, store) = engine();
    let caller = Caller::new("admin");
    engine.create("user", &alice(), &caller)?;

    let first = engine.apply_patch(
        "user",
        "alice",
        &alice().with_explicit("roles", json!([{"name": "r1"}])),
        &caller,
    )?;
    assert!(!first.consolidated);
    assert_eq!(first.snapshot.version, EntityVersion::INITIAL.next_minor());

    let second = engine.apply_patch(
        "user",
        "alice",
        &alice().with_explicit("roles", json!([{"name": "r1"}, {"name": "r2"}])),
        &caller,
    )?;
    assert!(second.consolidated);
    assert_eq!(second.snapshot.version, first.snapshot.version);
    assert_eq!(
        second.record.changes,
        vec![FieldChange::added(
            "roles",
            json!([{"name": "r1"}, {"name": "r2"}])
        )]
    );

    // One creation record plus one consolidated patch record.
    assert_eq!(store.records("user", "alice")?.len(), 2);
    Ok(())
}

#[test]
fn patching_twice_with_the_same_snapshot_is_idempotent() -> anyhow::Result<()> {
    let (engine, _store) = engine();
    let caller = Caller::new("admin");
    engine.create("user", &alice(), &caller)?;

    let requested = alice().with_explicit("displayName", json!("Alice"));
    let first = engine.apply_patch("user", "alice", &requested, &caller)?;
    assert_eq!(first.record.update_kind, UpdateKind::Minor);

    let second = engine.apply_patch("user", "alice", &requested, &caller)?;
    assert_eq!(second.record.update_kind, UpdateKind::NoChange);
    assert!(second.record.changes.is_empty());
    assert_eq!(second.snapshot.version, first.snapshot.version);
    Ok(())
}

#[test]
fn default_membership_replaced_by_chosen_teams() -> anyhow::Result<()> {
    let (engine, _store) = engine();
    let caller = Caller::new("admin");
    // Creation applies a default organization membership.
    engine.create(
        "user",
        &alice().with_default("teams", json!([{"name": "org"}])),
        &caller,
    )?;

    let outcome = engine.apply_patch(
        "user",
        "alice",
        &alice().with_explicit("teams", json!([{"name": "t1"}, {"name": "t2"}])),
        &caller,
    )?;
    assert_eq!(
        outcome.record.changes,
        vec![
            FieldChange::added("teams", json!([{"name": "t1"}, {"name": "t2"}])),
            FieldChange::deleted("teams", json!([{"name": "org"}])),
        ]
    );
    Ok(())
}

/// Persistence decorator that sneaks a concurrent editor's commit in ahead
/// of the next commit, forcing a version conflict on the caller.
struct ContendedPersistence {
    inner: MemoryStore,
    interloper: std::sync::Mutex<Option<Snapshot>>,
}

impl vellum::store::Persistence for ContendedPersistence {
    fn load(&self, entity_type: &str, key: &str) -> vellum::Result<Option<Snapshot>> {
        self.inner.load(entity_type, key)
    }

    fn commit(
        &self,
        snapshot: &Snapshot,
        expected_version: Option<EntityVersion>,
    ) -> vellum::Result<()> {
        if let Some(other) = self.interloper.lock().unwrap().take() {
            self.inner.commit(&other, expected_version)?;
        }
        self.inner.commit(snapshot, expected_version)
    }

    fn list(&self, entity_type: &str) -> vellum::Result<Vec<Snapshot>> {
        self.inner.list(entity_type)
    }
}

#[test]
fn conflicting_patch_retries_with_only_its_own_delta() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = MemoryStore::new();
    let contended = std::sync::Arc::new(ContendedPersistence {
        inner: store.clone(),
        interloper: std::sync::Mutex::new(None),
    });
    let engine = CatalogEngine::builder()
        .persistence(contended.clone())
        .history(std::sync::Arc::new(store.clone()))
        .resolver(std::sync::Arc::new(store.clone()))
        .register(user_schema())
        .build()
        .unwrap();
    let caller = Caller::new("admin");
    engine.create("user", &alice(), &caller)?;

    // Another editor lands a displayName change between this patch's read
    // and its commit.
    let concurrent = alice()
        .with_explicit("displayName", json!("Concurrent"))
        .with_version(EntityVersion::INITIAL.next_minor());
    *contended.interloper.lock().unwrap() = Some(concurrent);

    let outcome = engine.apply_patch(
        "user",
        "alice",
        &alice().with_explicit("timezone", json!("UTC")),
        &caller,
    )?;

    // The retried patch carries only its own field delta and keeps the
    // concurrent editor's change.
    assert_eq!(
        outcome.record.changes,
        vec![FieldChange::added("timezone", json!("UTC"))]
    );
    assert_eq!(
        outcome.snapshot.value("displayName"),
        Some(&json!("Concurrent"))
    );
    assert_eq!(outcome.snapshot.value("timezone"), Some(&json!("UTC")));
    assert_eq!(
        outcome.snapshot.version,
        EntityVersion::INITIAL.next_minor().next_minor()
    );
    Ok(())
}

#[test]
fn change_records_replay_onto_the_previous_snapshot() -> anyhow::Result<()> {
    let (engine, store) = engine();
    let caller = Caller::new("admin");
    engine.create("user", &alice(), &caller)?;

    let requested = alice()
        .with_explicit("displayName", json!("Alice"))
        .with_explicit("roles", json!([{"name": "r1"}]));
    let outcome = engine.apply_patch("user", "alice", &requested, &caller)?;

    // Applying the recorded changes to the old snapshot reproduces the new
    // one, field by field.
    let record = store.records("user", "alice")?.pop().unwrap();
    let mut replayed = alice().with_version(outcome.snapshot.version);
    for change in &record.changes {
        match change.kind {
            ChangeKind::Added | ChangeKind::Updated => {
                replayed.set_field(
                    change.field.clone(),
                    vellum::snapshot::FieldValue::Explicit(
                        change.new_value.clone().unwrap(),
                    ),
                );
            }
            ChangeKind::Deleted => {
                replayed.set_field(change.field.clone(), vellum::snapshot::FieldValue::Unset);
            }
        }
    }
    assert_eq!(replayed, outcome.snapshot);
    Ok(())
}
