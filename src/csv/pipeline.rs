use rayon::prelude::*;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::job::CancelToken;
use crate::patch::PatchEngine;
use crate::schema::EntitySchema;
use crate::snapshot::{FieldValue, Snapshot};
use crate::store::{Caller, EntityReference, Persistence, ReferenceResolver};

use super::contract::CsvContract;
use super::types::{ImportReport, ImportStatus, RowResult, RowStatus};
use super::wire;

/// One pipeline run: PARSE -> VALIDATE (parallel per row) -> APPLY
/// (sequential, row order) -> AGGREGATE. Fault isolation is per row; a bad
/// row never blocks the rows after it.
pub struct CsvPipeline<'a> {
    schema: &'a EntitySchema,
    contract: &'a CsvContract,
    persistence: &'a dyn Persistence,
    resolver: &'a dyn ReferenceResolver,
    patch: &'a PatchEngine,
}

struct Row {
    number: usize,
    raw: String,
    key: Option<String>,
    fields: Vec<(String, Value)>,
    errors: Vec<String>,
}

impl Row {
    fn failed(number: usize, raw: &str, error: String) -> Self {
        Row {
            number,
            raw: raw.to_string(),
            key: None,
            fields: Vec::new(),
            errors: vec![error],
        }
    }

    fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<'a> CsvPipeline<'a> {
    pub fn new(
        schema: &'a EntitySchema,
        contract: &'a CsvContract,
        persistence: &'a dyn Persistence,
        resolver: &'a dyn ReferenceResolver,
        patch: &'a PatchEngine,
    ) -> Self {
        CsvPipeline {
            schema,
            contract,
            persistence,
            resolver,
            patch,
        }
    }

    /// Runs the pipeline over a raw text payload. Validation problems are
    /// reported per row inside the returned report; only a header-contract
    /// mismatch or an unexpected collaborator failure comes back as `Err`.
    pub fn run(
        &self,
        text: &str,
        scope: Option<&EntityReference>,
        dry_run: bool,
        cancel: &CancelToken,
        caller: &Caller,
    ) -> Result<ImportReport> {
        let entity_type = self.contract.entity_type();
        let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));
        let header = lines
            .next()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| EngineError::PipelineAbort("empty csv payload".to_string()))?;
        if header != self.contract.header() {
            return Err(EngineError::PipelineAbort(format!(
                "invalid header: expected '{}', found '{}'",
                self.contract.header(),
                header
            )));
        }

        let data: Vec<(usize, String)> = lines
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, l)| (i + 1, l.to_string()))
            .collect();
        log::debug!(
            "importing {} rows of {} (dry_run={})",
            data.len(),
            entity_type,
            dry_run
        );

        // Validation has no shared mutable state, so rows fan out.
        let scope_hint = scope;
        let mut rows: Vec<Row> = data
            .par_iter()
            .map(|(number, raw)| self.parse_and_validate(*number, raw, scope_hint))
            .collect::<Result<Vec<Row>>>()?;

        let cancelled = if dry_run {
            false
        } else {
            self.apply_rows(&mut rows, cancel, caller)?
        };

        Ok(self.aggregate(rows, dry_run, cancelled))
    }

    fn parse_and_validate(
        &self,
        number: usize,
        raw: &str,
        scope: Option<&EntityReference>,
    ) -> Result<Row> {
        let cells = match wire::split_line(raw) {
            Err(error) => return Ok(Row::failed(number, raw, error)),
            Ok(cells) => cells,
        };
        let expected = self.contract.columns().len();
        if cells.len() != expected {
            return Ok(Row::failed(
                number,
                raw,
                format!("expected {} columns, found {}", expected, cells.len()),
            ));
        }

        let conversion = self.contract.convert_row(&cells, self.resolver, scope)?;
        let key = self.contract.row_key(&cells);
        let mut errors = conversion.errors;
        if errors.is_empty() && key.is_none() {
            errors.push("missing entity key".to_string());
        }
        Ok(Row {
            number,
            raw: raw.to_string(),
            key,
            fields: conversion.fields,
            errors,
        })
    }

    /// Applies validated rows in input order, so that two rows targeting the
    /// same entity resolve last-row-wins. Returns whether the run was
    /// cancelled between rows.
    fn apply_rows(
        &self,
        rows: &mut [Row],
        cancel: &CancelToken,
        caller: &Caller,
    ) -> Result<bool> {
        let entity_type = self.contract.entity_type();
        for index in 0..rows.len() {
            if !rows[index].ok() {
                continue;
            }
            if cancel.is_cancelled() {
                log::info!(
                    "{} import cancelled before row {}",
                    entity_type,
                    rows[index].number
                );
                for row in rows[index..].iter_mut().filter(|r| r.ok()) {
                    row.errors.push("not applied: import cancelled".to_string());
                }
                return Ok(true);
            }
            if let Err(error) = self.apply_row(&rows[index], caller) {
                match error {
                    EngineError::Internal(_) | EngineError::PipelineAbort(_) => {
                        return Err(error)
                    }
                    recoverable => {
                        log::warn!(
                            "{} import row {} failed: {}",
                            entity_type,
                            rows[index].number,
                            recoverable
                        );
                        rows[index].errors.push(recoverable.to_string());
                    }
                }
            }
        }
        Ok(false)
    }

    fn apply_row(&self, row: &Row, caller: &Caller) -> Result<()> {
        let key = row
            .key
            .as_deref()
            .ok_or_else(|| EngineError::internal("validated row without an entity key"))?;
        let mut requested = Snapshot::new(self.contract.entity_type(), key);
        for (field, value) in &row.fields {
            requested.set_field(field.clone(), FieldValue::Explicit(value.clone()));
        }

        match self.persistence.load(self.contract.entity_type(), key)? {
            None => self.patch.create(self.schema, &requested, caller).map(|_| ()),
            Some(_) => self
                .patch
                .apply(self.schema, key, &requested, caller)
                .map(|_| ()),
        }
    }

    /// Builds the report. Counts follow the wire convention of the original
    /// result format: the header line is included as one processed row.
    fn aggregate(&self, rows: Vec<Row>, dry_run: bool, cancelled: bool) -> ImportReport {
        let mut result_rows = vec![self.contract.result_header()];
        let mut row_results = Vec::new();
        let mut success_count = 1; // the accepted header
        let mut failure_count = 0;

        for row in &rows {
            let status = if row.ok() {
                success_count += 1;
                RowStatus::Success
            } else {
                failure_count += 1;
                RowStatus::Failure
            };
            let details = row.errors.join("; ");
            let prefix = match status {
                RowStatus::Success => "success",
                RowStatus::Failure => "failure",
            };
            result_rows.push(format!(
                "{},{},{}",
                prefix,
                wire::quote_cell(&details),
                row.raw
            ));
            row_results.push(RowResult {
                row_number: row.number,
                status,
                errors: row.errors.clone(),
            });
        }

        let status = if cancelled {
            ImportStatus::Aborted
        } else if failure_count == 0 {
            ImportStatus::Success
        } else if success_count == 0 {
            ImportStatus::Failure
        } else {
            ImportStatus::PartialSuccess
        };
        log::info!(
            "{} import finished: {:?}, {} passed, {} failed of {}",
            self.contract.entity_type(),
            status,
            success_count,
            failure_count,
            rows.len() + 1
        );

        ImportReport {
            total_rows: rows.len() + 1,
            success_count,
            failure_count,
            status,
            dry_run,
            row_results,
            result_rows,
        }
    }
}
