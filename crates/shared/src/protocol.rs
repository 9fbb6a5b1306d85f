use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ColumnType, RecordId, RelatedListKind, ToastVariant},
    error::FetchFailure,
};

/// Name of the only flow input variable the record page hands to a side flow.
pub const FLOW_RECORD_ID_INPUT: &str = "recordId";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedListQuery {
    pub parent_record_id: RecordId,
    pub related_list_id: RelatedListKind,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(
        default,
        rename = "displayValue",
        skip_serializing_if = "Option::is_none"
    )]
    pub display_value: Option<String>,
}

impl FieldValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            display_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: RecordId,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), FieldValue::new(value));
        self
    }

    /// Present, non-null value of `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.fields
            .get(name)
            .and_then(|field| field.value.as_ref())
            .filter(|value| !value.is_null())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelatedListRecords {
    pub records: Vec<RawRecord>,
}

/// One delivery from a related-list subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emission {
    Data(RelatedListRecords),
    Error(FetchFailure),
}

impl Emission {
    pub fn records(records: Vec<RawRecord>) -> Self {
        Self::Data(RelatedListRecords { records })
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Error(FetchFailure::new(message))
    }
}

/// Update payload, serialised flat as `{ "Id": ..., "<Field>": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    #[serde(rename = "Id")]
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

/// Unsaved inline edits for one grid row, keyed by column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditDraft {
    #[serde(rename = "Id")]
    pub id: RecordId,
    #[serde(flatten)]
    pub changes: BTreeMap<String, Value>,
}

impl EditDraft {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            changes: BTreeMap::new(),
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.insert(column.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toast {
    pub title: String,
    pub message: String,
    pub variant: ToastVariant,
}

impl Toast {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            title: "Success".to_string(),
            message: message.into(),
            variant: ToastVariant::Success,
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            variant: ToastVariant::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.variant == ToastVariant::Error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInputVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
}

impl FlowInputVariable {
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "String".to_string(),
            value: Value::String(value.into()),
        }
    }
}

/// Status string reported by a guided flow when its lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowStatus(pub String);

impl FlowStatus {
    pub const FINISHED: &'static str = "FINISHED";

    pub fn finished() -> Self {
        Self(Self::FINISHED.to_string())
    }

    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    pub fn is_finished(&self) -> bool {
        self.0 == Self::FINISHED
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
    pub field_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<FieldRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu_alignment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field_name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub editable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_attributes: Option<TypeAttributes>,
}

impl ColumnDef {
    pub fn new(label: impl Into<String>, field_name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            label: label.into(),
            field_name: field_name.into(),
            column_type,
            editable: false,
            type_attributes: None,
        }
    }

    pub fn editable(mut self) -> Self {
        self.editable = true;
        self
    }

    pub fn with_type_attributes(mut self, attributes: TypeAttributes) -> Self {
        self.type_attributes = Some(attributes);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowAction {
    pub label: String,
    pub name: String,
}

impl RowAction {
    pub const DELETE: &'static str = "delete";

    pub fn delete() -> Self {
        Self {
            label: "Delete".to_string(),
            name: Self::DELETE.to_string(),
        }
    }
}
