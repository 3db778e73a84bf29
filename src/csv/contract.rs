use regex::Regex;
use serde_json::Value;

use crate::change::recorder::element_key;
use crate::error::{EngineError, Result};
use crate::snapshot::Snapshot;
use crate::store::{EntityReference, ReferenceResolver};

use super::wire;

/// How a column's cells are typed, validated, and bound onto the snapshot
/// field of the same name.
#[derive(Clone, Debug)]
pub enum ColumnKind {
    Text,
    Boolean,
    /// Single reference to an entity of the given type; must resolve.
    Reference { entity_type: String },
    /// Secondary-delimited list of references; every element must resolve,
    /// and for a scoped column every element must sit inside the run's
    /// scope.
    ReferenceList { entity_type: String, scoped: bool },
    /// Enum membership.
    Choice { allowed: Vec<String> },
}

#[derive(Clone, Debug)]
pub struct CsvColumn {
    pub name: String,
    pub required: bool,
    pub pattern: Option<Regex>,
    pub kind: ColumnKind,
}

/// Declared header contract for one entity type: an ordered list of named,
/// typed columns. Immutable once built.
#[derive(Clone, Debug)]
pub struct CsvContract {
    entity_type: String,
    key_column: usize,
    columns: Vec<CsvColumn>,
}

/// One row converted against the contract: the field values that parsed
/// plus every validation error, each naming the offending column index.
#[derive(Clone, Debug, Default)]
pub(crate) struct RowConversion {
    pub fields: Vec<(String, Value)>,
    pub errors: Vec<String>,
}

impl CsvContract {
    pub fn builder(entity_type: impl Into<String>) -> CsvContractBuilder {
        CsvContractBuilder {
            entity_type: entity_type.into(),
            key_column: 0,
            columns: Vec::new(),
            error: None,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn columns(&self) -> &[CsvColumn] {
        &self.columns
    }

    /// The declared header line.
    pub fn header(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        wire::join_line(&names)
    }

    /// Header of the echoed result payload: status and details prepended to
    /// the declared columns.
    pub fn result_header(&self) -> String {
        format!("status,details,{}", self.header())
    }

    /// The entity key carried by a row, if its key cell is non-empty.
    pub(crate) fn row_key(&self, cells: &[String]) -> Option<String> {
        cells
            .get(self.key_column)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
    }

    /// Validates and converts one parsed row. Collaborator failures abort
    /// the run; validation problems land in the returned error list.
    pub(crate) fn convert_row(
        &self,
        cells: &[String],
        resolver: &dyn ReferenceResolver,
        scope: Option<&EntityReference>,
    ) -> Result<RowConversion> {
        let mut conversion = RowConversion::default();
        for (index, column) in self.columns.iter().enumerate() {
            let cell = cells.get(index).map(|c| c.trim()).unwrap_or("");
            if cell.is_empty() {
                if column.required {
                    conversion.errors.push(format!(
                        "missing required value for '{}' at column {}",
                        column.name, index
                    ));
                }
                continue;
            }
            if let Some(pattern) = &column.pattern {
                if !pattern.is_match(cell) {
                    conversion.errors.push(format!(
                        "invalid value '{}' for '{}' at column {}",
                        cell, column.name, index
                    ));
                    continue;
                }
            }
            match self.convert_cell(index, column, cell, resolver, scope)? {
                Ok(value) => conversion.fields.push((column.name.clone(), value)),
                Err(error) => conversion.errors.push(error),
            }
        }
        Ok(conversion)
    }

    fn convert_cell(
        &self,
        index: usize,
        column: &CsvColumn,
        cell: &str,
        resolver: &dyn ReferenceResolver,
        scope: Option<&EntityReference>,
    ) -> Result<std::result::Result<Value, String>> {
        let converted = match &column.kind {
            ColumnKind::Text => Ok(Value::String(cell.to_string())),
            ColumnKind::Boolean => match cell.to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!(
                    "invalid boolean '{}' for '{}' at column {}",
                    cell, column.name, index
                )),
            },
            ColumnKind::Choice { allowed } => {
                if allowed.iter().any(|a| a == cell) {
                    Ok(Value::String(cell.to_string()))
                } else {
                    Err(format!(
                        "value '{}' for '{}' must be one of [{}] at column {}",
                        cell,
                        column.name,
                        allowed.join(", "),
                        index
                    ))
                }
            }
            ColumnKind::Reference { entity_type } => {
                match resolver.resolve(entity_type, cell)? {
                    Some(reference) => Ok(reference_value(&reference)),
                    None => Err(format!(
                        "{} '{}' not found at column {}",
                        entity_type, cell, index
                    )),
                }
            }
            ColumnKind::ReferenceList { entity_type, scoped } => {
                let mut elements = Vec::new();
                let mut error = None;
                for name in wire::split_values(cell) {
                    match resolver.resolve(entity_type, &name)? {
                        None => {
                            error = Some(format!(
                                "{} '{}' not found at column {}",
                                entity_type, name, index
                            ));
                            break;
                        }
                        Some(reference) => {
                            if *scoped {
                                if let Some(scope) = scope {
                                    if !resolver.in_scope(&reference, scope)? {
                                        error = Some(format!(
                                            "{} '{}' is outside scope '{}' at column {}",
                                            entity_type, name, scope.name, index
                                        ));
                                        break;
                                    }
                                }
                            }
                            elements.push(reference_value(&reference));
                        }
                    }
                }
                match error {
                    Some(error) => Err(error),
                    None => Ok(Value::Array(elements)),
                }
            }
        };
        Ok(converted)
    }

    /// Renders a snapshot field back into its cell representation, the
    /// inverse of `convert_row`.
    pub(crate) fn render_cell(&self, column: &CsvColumn, snapshot: &Snapshot) -> String {
        let Some(value) = snapshot.value(&column.name) else {
            return String::new();
        };
        match &column.kind {
            ColumnKind::Text | ColumnKind::Choice { .. } => value
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| value.to_string()),
            ColumnKind::Boolean => value
                .as_bool()
                .map(|b| b.to_string())
                .unwrap_or_default(),
            ColumnKind::Reference { .. } => element_key(value, "name"),
            ColumnKind::ReferenceList { .. } => {
                let names: Vec<String> = value
                    .as_array()
                    .map(|elements| {
                        elements.iter().map(|e| element_key(e, "name")).collect()
                    })
                    .unwrap_or_default();
                wire::join_values(&names)
            }
        }
    }
}

fn reference_value(reference: &EntityReference) -> Value {
    serde_json::json!({
        "entity_type": reference.entity_type,
        "name": reference.name,
    })
}

pub struct CsvContractBuilder {
    entity_type: String,
    key_column: usize,
    columns: Vec<CsvColumn>,
    error: Option<String>,
}

impl CsvContractBuilder {
    fn push(mut self, name: impl Into<String>, kind: ColumnKind) -> Self {
        self.columns.push(CsvColumn {
            name: name.into(),
            required: false,
            pattern: None,
            kind,
        });
        self
    }

    pub fn text(self, name: impl Into<String>) -> Self {
        self.push(name, ColumnKind::Text)
    }

    pub fn boolean(self, name: impl Into<String>) -> Self {
        self.push(name, ColumnKind::Boolean)
    }

    pub fn reference(self, name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        self.push(
            name,
            ColumnKind::Reference {
                entity_type: entity_type.into(),
            },
        )
    }

    pub fn reference_list(self, name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        self.push(
            name,
            ColumnKind::ReferenceList {
                entity_type: entity_type.into(),
                scoped: false,
            },
        )
    }

    pub fn choice(
        self,
        name: impl Into<String>,
        allowed: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.push(
            name,
            ColumnKind::Choice {
                allowed: allowed.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Marks the most recently added column as required.
    pub fn required(mut self) -> Self {
        if let Some(column) = self.columns.last_mut() {
            column.required = true;
        }
        self
    }

    /// Format rule for the most recently added column.
    pub fn pattern(mut self, pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => {
                if let Some(column) = self.columns.last_mut() {
                    column.pattern = Some(regex);
                }
            }
            Err(e) => self.error = Some(format!("invalid pattern '{}': {}", pattern, e)),
        }
        self
    }

    /// Constrains the most recently added reference-list column to the
    /// run's scope hint.
    pub fn scoped(mut self) -> Self {
        if let Some(CsvColumn {
            kind: ColumnKind::ReferenceList { scoped, .. },
            ..
        }) = self.columns.last_mut()
        {
            *scoped = true;
        }
        self
    }

    /// Marks the most recently added column as the one carrying the entity
    /// key. Defaults to the first column.
    pub fn key(mut self) -> Self {
        if !self.columns.is_empty() {
            self.key_column = self.columns.len() - 1;
        }
        self
    }

    pub fn build(self) -> Result<CsvContract> {
        if let Some(error) = self.error {
            return Err(EngineError::Validation(error));
        }
        if self.columns.is_empty() {
            return Err(EngineError::Validation(
                "csv contract declares no columns".to_string(),
            ));
        }
        Ok(CsvContract {
            entity_type: self.entity_type,
            key_column: self.key_column,
            columns: self.columns,
        })
    }
}
