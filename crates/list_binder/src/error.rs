use shared::domain::RecordId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinderError {
    #[error("parent record id is missing")]
    MissingParent,
    #[error("related list fetch failed: {message}")]
    Fetch { message: String },
    #[error("record mutation failed: {message}")]
    Mutation { message: String },
    #[error("field `{field}` is not editable")]
    NonEditableField { field: String },
    #[error("an action for record {record_id} is already in flight")]
    ActionInFlight { record_id: RecordId },
    #[error("invalid value for `{field}`: {message}")]
    InvalidValue { field: String, message: String },
    #[error("unknown row action `{name}`")]
    UnknownAction { name: String },
    #[error("side flow failed: {message}")]
    Flow { message: String },
    #[error("binder has no side flow configured")]
    NoSideFlow,
    #[error("binder has no live subscription")]
    NotSubscribed,
    #[error("binder is detached")]
    Detached,
}
