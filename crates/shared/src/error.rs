use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    EntityIsDeleted,
    InvalidField,
    InsufficientAccess,
    Unavailable,
}

/// Error payload as delivered by the record platform: `{ "message": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(
        default,
        rename = "errorCode",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_code: Option<ErrorCode>,
}

/// Failed subscription emission, shaped `{ "body": { "message": ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub body: ErrorBody,
}

impl FetchFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            body: ErrorBody {
                message: message.into(),
                error_code: None,
            },
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            body: ErrorBody {
                message: message.into(),
                error_code: Some(code),
            },
        }
    }

    pub fn message(&self) -> &str {
        &self.body.message
    }
}

#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct RecordApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl RecordApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
