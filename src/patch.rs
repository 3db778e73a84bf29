use std::sync::Arc;

use crate::change::record::{now_millis, ChangeRecord, UpdateKind};
use crate::change::{consolidate, diff, recorder};
use crate::error::{EngineError, Result};
use crate::schema::EntitySchema;
use crate::snapshot::{EntityVersion, Snapshot};
use crate::store::{Authorization, Caller, ChangeHistoryStore, Persistence};

/// Patches that land within this window of the previous one (and before the
/// version is observed externally) consolidate into the existing change
/// record instead of starting a new one.
const DEFAULT_SESSION_WINDOW_MS: i64 = 10 * 60 * 1000;

const MAX_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct PatchOutcome {
    pub snapshot: Snapshot,
    pub record: ChangeRecord,
    pub consolidated: bool,
}

/// Applies caller-submitted snapshots against the persisted state: overlays
/// the fields the caller may touch, diffs, consolidates same-version
/// follow-up patches, and commits with a bounded optimistic retry.
pub struct PatchEngine {
    persistence: Arc<dyn Persistence>,
    authorization: Arc<dyn Authorization>,
    history: Arc<dyn ChangeHistoryStore>,
    session_window_ms: i64,
}

impl PatchEngine {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        authorization: Arc<dyn Authorization>,
        history: Arc<dyn ChangeHistoryStore>,
    ) -> Self {
        PatchEngine {
            persistence,
            authorization,
            history,
            session_window_ms: DEFAULT_SESSION_WINDOW_MS,
        }
    }

    pub fn with_session_window_ms(mut self, session_window_ms: i64) -> Self {
        self.session_window_ms = session_window_ms;
        self
    }

    /// Applies a full requested snapshot to an existing entity. Fields the
    /// caller may not modify are silently reverted to their current values;
    /// the call only fails with `Forbidden` when the caller may touch none
    /// of the changed fields.
    pub fn apply(
        &self,
        schema: &EntitySchema,
        key: &str,
        requested: &Snapshot,
        caller: &Caller,
    ) -> Result<PatchOutcome> {
        let entity_type = schema.entity_type();
        // The caller's intent is the field set that differed from the state
        // they patched against. A conflict retry overlays only those fields
        // onto the refreshed snapshot, so a concurrent editor's unrelated
        // changes survive and the retried record carries only this patch's
        // own delta.
        let mut intent: Option<Vec<String>> = None;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self
                .persistence
                .load(entity_type, key)?
                .ok_or_else(|| EngineError::not_found(entity_type, key))?;
            let changed = match &intent {
                Some(fields) => fields.clone(),
                None => {
                    let fields = changed_fields(&diff(schema, &current, requested));
                    intent = Some(fields.clone());
                    fields
                }
            };
            match self.try_apply(schema, &current, requested, &changed, caller) {
                Err(EngineError::Conflict { .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    log::warn!(
                        "version conflict patching {} '{}', retrying (attempt {})",
                        entity_type,
                        key,
                        attempt
                    );
                }
                outcome => return outcome,
            }
        }
    }

    /// Creates a new entity from a requested snapshot. Unlike `apply`,
    /// creation does not silently drop disallowed fields; the caller must be
    /// allowed to set everything the snapshot carries.
    pub fn create(
        &self,
        schema: &EntitySchema,
        requested: &Snapshot,
        caller: &Caller,
    ) -> Result<PatchOutcome> {
        let entity_type = schema.entity_type();
        let set_fields: Vec<String> = schema
            .fields()
            .iter()
            .filter(|f| !f.system_managed && requested.field(&f.name).is_set())
            .map(|f| f.name.clone())
            .collect();
        let allowed = self
            .authorization
            .can_modify_fields(caller, entity_type, &set_fields)?;
        if allowed.len() < set_fields.len() {
            return Err(EngineError::Forbidden(format!(
                "{} may not create {} '{}'",
                caller.principal, entity_type, requested.key
            )));
        }

        let snapshot = requested.clone().with_version(EntityVersion::INITIAL);
        let record = recorder::creation(schema, &snapshot);
        self.persistence.commit(&snapshot, None)?;
        self.history.append(entity_type, &snapshot.key, &record)?;
        log::debug!(
            "created {} '{}' at version {}",
            entity_type,
            snapshot.key,
            snapshot.version
        );
        Ok(PatchOutcome {
            snapshot,
            record,
            consolidated: false,
        })
    }

    fn try_apply(
        &self,
        schema: &EntitySchema,
        current: &Snapshot,
        requested: &Snapshot,
        changed: &[String],
        caller: &Caller,
    ) -> Result<PatchOutcome> {
        let entity_type = schema.entity_type();
        if changed.is_empty() {
            return Ok(PatchOutcome {
                snapshot: current.clone(),
                record: ChangeRecord::no_change(current.version),
                consolidated: false,
            });
        }

        let allowed = self
            .authorization
            .can_modify_fields(caller, entity_type, changed)?;
        if allowed.is_empty() {
            return Err(EngineError::Forbidden(format!(
                "{} may not modify {} '{}'",
                caller.principal, entity_type, current.key
            )));
        }

        let effective = overlay(schema, current, requested, &allowed);
        let fresh = diff(schema, current, &effective);
        if fresh.is_no_change() {
            return Ok(PatchOutcome {
                snapshot: current.clone(),
                record: fresh,
                consolidated: false,
            });
        }

        let (record, consolidated, new_version) =
            self.consolidation_target(schema, current, &fresh)?;
        let new_snapshot = effective.with_version(new_version);
        self.persistence.commit(&new_snapshot, Some(current.version))?;
        self.history.append(entity_type, &current.key, &record)?;
        log::debug!(
            "patched {} '{}' {} -> {} ({:?}, consolidated={})",
            entity_type,
            current.key,
            record.previous_version,
            record.new_version,
            record.update_kind,
            consolidated
        );
        Ok(PatchOutcome {
            snapshot: new_snapshot,
            record,
            consolidated,
        })
    }

    /// A minor follow-up patch merges into the stored record when that
    /// record is a real version transition to the current version and the
    /// previous patch landed within the session window. Major changes always
    /// start a fresh record.
    fn consolidation_target(
        &self,
        schema: &EntitySchema,
        current: &Snapshot,
        fresh: &ChangeRecord,
    ) -> Result<(ChangeRecord, bool, EntityVersion)> {
        if fresh.update_kind == UpdateKind::Minor {
            if let Some(last) = self
                .history
                .last_record(schema.entity_type(), &current.key)?
            {
                let transition = last.previous_version < last.new_version;
                let same_version = last.new_version == current.version;
                let in_window = now_millis() - last.updated_at <= self.session_window_ms;
                if transition && same_version && in_window {
                    let merged = consolidate(schema, &last, fresh);
                    return Ok((merged, true, current.version));
                }
            }
        }
        Ok((fresh.clone(), false, fresh.new_version))
    }
}

/// Current snapshot with the allowed fields replaced by their requested
/// state. System-managed fields always keep their current values.
fn overlay(
    schema: &EntitySchema,
    current: &Snapshot,
    requested: &Snapshot,
    allowed: &[String],
) -> Snapshot {
    let mut effective = current.clone();
    for field in schema.fields() {
        if field.system_managed {
            continue;
        }
        if allowed.contains(&field.name) {
            effective.set_field(&field.name, requested.field(&field.name).clone());
        }
    }
    effective
}

/// Field names touched by a record, first-appearance order.
fn changed_fields(record: &ChangeRecord) -> Vec<String> {
    let mut fields = Vec::new();
    for change in &record.changes {
        if !fields.contains(&change.field) {
            fields.push(change.field.clone());
        }
    }
    fields
}
