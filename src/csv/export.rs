use crate::change::recorder::element_key;
use crate::error::Result;
use crate::snapshot::Snapshot;
use crate::store::{EntityReference, Persistence, ReferenceResolver};

use super::contract::{ColumnKind, CsvContract};
use super::wire;

/// Renders every entity of the contract's type into the declared wire
/// format, the inverse of import: header row first, one row per entity,
/// ordered by key. With a scope hint only entities attached (through a
/// scoped column) to that sub-hierarchy are included.
pub fn export(
    contract: &CsvContract,
    persistence: &dyn Persistence,
    resolver: &dyn ReferenceResolver,
    scope: Option<&EntityReference>,
) -> Result<String> {
    let snapshots = persistence.list(contract.entity_type())?;
    let mut lines = vec![contract.header()];

    let mut exported = 0;
    for snapshot in &snapshots {
        if let Some(scope) = scope {
            if !attached_to_scope(contract, snapshot, resolver, scope)? {
                continue;
            }
        }
        let cells: Vec<String> = contract
            .columns()
            .iter()
            .map(|column| contract.render_cell(column, snapshot))
            .collect();
        lines.push(wire::join_line(&cells));
        exported += 1;
    }

    log::debug!(
        "exported {} of {} {} entities",
        exported,
        snapshots.len(),
        contract.entity_type()
    );
    Ok(lines.join("\n"))
}

/// Whether any element of a scoped reference-list column resolves inside
/// the scope. Contracts without a scoped column export everything.
fn attached_to_scope(
    contract: &CsvContract,
    snapshot: &Snapshot,
    resolver: &dyn ReferenceResolver,
    scope: &EntityReference,
) -> Result<bool> {
    let mut has_scoped_column = false;
    for column in contract.columns() {
        let ColumnKind::ReferenceList {
            entity_type,
            scoped: true,
        } = &column.kind
        else {
            continue;
        };
        has_scoped_column = true;
        let Some(elements) = snapshot.value(&column.name).and_then(|v| v.as_array()) else {
            continue;
        };
        for element in elements {
            let reference = EntityReference::new(entity_type.clone(), element_key(element, "name"));
            if resolver.in_scope(&reference, scope)? {
                return Ok(true);
            }
        }
    }
    Ok(!has_scoped_column)
}
