//! Declarative projection of nested related-list records into flat grid rows.
//!
//! Every requested source field is described once by a [`FieldProjection`]
//! carrying its default and transform, so absent values and scale
//! conversions are handled uniformly instead of per column.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use shared::{
    domain::RecordId,
    protocol::{EditDraft, RawRecord, RecordUpdate},
};
use tracing::debug;
use url::Url;

use crate::error::BinderError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(*number),
            Self::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    /// Stored on a ×100 integer scale; displayed as `stored / 100`.
    Percent,
}

impl Transform {
    pub fn to_display(self, stored: f64) -> f64 {
        match self {
            Self::Identity => stored,
            Self::Percent => stored / 100.0,
        }
    }

    pub fn to_source(self, displayed: f64) -> f64 {
        match self {
            Self::Identity => displayed,
            // Stored values are whole numbers on the ×100 scale.
            Self::Percent => (displayed * 100.0).round(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldProjection {
    pub source: String,
    pub column: String,
    pub kind: FieldKind,
    pub default: CellValue,
    pub transform: Transform,
    pub editable: bool,
}

impl FieldProjection {
    pub fn text(source: impl Into<String>) -> Self {
        Self::with_kind(source, FieldKind::Text, CellValue::text(""), Transform::Identity)
    }

    pub fn number(source: impl Into<String>) -> Self {
        Self::with_kind(source, FieldKind::Number, CellValue::Number(0.0), Transform::Identity)
    }

    pub fn percent(source: impl Into<String>) -> Self {
        Self::with_kind(source, FieldKind::Number, CellValue::Number(0.0), Transform::Percent)
    }

    fn with_kind(
        source: impl Into<String>,
        kind: FieldKind,
        default: CellValue,
        transform: Transform,
    ) -> Self {
        let source = source.into();
        Self {
            column: source.clone(),
            source,
            kind,
            default,
            transform,
            editable: false,
        }
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    pub fn default_value(mut self, default: CellValue) -> Self {
        self.default = default;
        self
    }

    pub fn editable(mut self) -> Self {
        self.editable = true;
        self
    }

    fn project(&self, record: &RawRecord) -> CellValue {
        let Some(value) = record.value(&self.source) else {
            return self.default.clone();
        };

        match self.kind {
            FieldKind::Text => match value {
                Value::String(text) => CellValue::Text(text.clone()),
                Value::Number(_) | Value::Bool(_) => CellValue::Text(value.to_string()),
                _ => {
                    debug!(record_id = %record.id, field = %self.source, "non-scalar text value; using default");
                    self.default.clone()
                }
            },
            FieldKind::Number => match numeric(value) {
                Some(number) => CellValue::Number(self.transform.to_display(number)),
                None => {
                    debug!(record_id = %record.id, field = %self.source, "non-numeric value; using default");
                    self.default.clone()
                }
            },
        }
    }

    fn to_source(&self, value: &Value) -> Result<Value, BinderError> {
        match self.kind {
            FieldKind::Text => Ok(match value {
                Value::String(_) | Value::Null => value.clone(),
                other => Value::String(other.to_string()),
            }),
            FieldKind::Number => {
                if value.is_null() {
                    return Ok(Value::Null);
                }
                numeric(value)
                    .map(|number| self.transform.to_source(number))
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| BinderError::InvalidValue {
                        field: self.column.clone(),
                        message: format!("expected a number, got {value}"),
                    })
            }
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Columns computed from the record itself rather than copied from a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivedColumn {
    /// `/lightning/r/{object}/{id}/view`, optionally joined onto a base URL.
    RecordLink {
        column: String,
        object_api_name: String,
    },
    /// 1-based position in the emitted order.
    RowNumber { column: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayRow {
    #[serde(rename = "Id")]
    pub id: RecordId,
    #[serde(flatten)]
    pub cells: BTreeMap<String, CellValue>,
}

impl DisplayRow {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.cells.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(CellValue::as_text)
    }

    pub fn number(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(CellValue::as_number)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectionTable {
    fields: Vec<FieldProjection>,
    derived: Vec<DerivedColumn>,
    link_base: Option<Url>,
}

impl ProjectionTable {
    pub fn new(fields: Vec<FieldProjection>) -> Self {
        Self {
            fields,
            derived: Vec::new(),
            link_base: None,
        }
    }

    pub fn with_derived(mut self, derived: DerivedColumn) -> Self {
        self.derived.push(derived);
        self
    }

    pub fn with_link_base(mut self, base: Url) -> Self {
        self.link_base = Some(base);
        self
    }

    pub fn fields(&self) -> &[FieldProjection] {
        &self.fields
    }

    pub fn field(&self, column: &str) -> Option<&FieldProjection> {
        self.fields.iter().find(|field| field.column == column)
    }

    /// Qualified `Object.Field` names to request from the source.
    pub fn requested_fields(&self, object_api_name: &str) -> Vec<String> {
        self.fields
            .iter()
            .map(|field| format!("{object_api_name}.{}", field.source))
            .collect()
    }

    pub fn project(&self, records: &[RawRecord]) -> Vec<DisplayRow> {
        records
            .iter()
            .enumerate()
            .map(|(index, record)| self.project_record(index, record))
            .collect()
    }

    fn project_record(&self, index: usize, record: &RawRecord) -> DisplayRow {
        let mut cells: BTreeMap<String, CellValue> = self
            .fields
            .iter()
            .map(|field| (field.column.clone(), field.project(record)))
            .collect();

        for derived in &self.derived {
            match derived {
                DerivedColumn::RecordLink {
                    column,
                    object_api_name,
                } => {
                    cells.insert(
                        column.clone(),
                        CellValue::Text(self.record_link(object_api_name, &record.id)),
                    );
                }
                DerivedColumn::RowNumber { column } => {
                    cells.insert(column.clone(), CellValue::Number((index + 1) as f64));
                }
            }
        }

        DisplayRow {
            id: record.id.clone(),
            cells,
        }
    }

    pub fn record_link(&self, object_api_name: &str, record_id: &RecordId) -> String {
        let path = format!("/lightning/r/{object_api_name}/{record_id}/view");
        match &self.link_base {
            Some(base) => base
                .join(&path)
                .map(|url| url.to_string())
                .unwrap_or(path),
            None => path,
        }
    }

    /// Turns a grid draft into a write-back payload, rejecting columns that
    /// are unknown or not editable and undoing display transforms.
    pub fn prepare_update(&self, draft: &EditDraft) -> Result<RecordUpdate, BinderError> {
        let mut fields = BTreeMap::new();
        for (column, value) in &draft.changes {
            let field = self
                .field(column)
                .filter(|field| field.editable)
                .ok_or_else(|| BinderError::NonEditableField {
                    field: column.clone(),
                })?;
            fields.insert(field.source.clone(), field.to_source(value)?);
        }

        Ok(RecordUpdate {
            id: draft.id.clone(),
            fields,
        })
    }
}

#[cfg(test)]
#[path = "tests/projection_tests.rs"]
mod tests;
