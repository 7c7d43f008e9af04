//! Protocol error types

use std::fmt;

/// Errors that can occur while decoding a wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame is not valid JSON
    Json(String),
    /// Top-level value is not a JSON object
    NotAnObject,
    /// Missing `type` field
    MissingType,
    /// Unknown message type
    UnknownType(String),
    /// Required field absent after normalization
    MissingField(&'static str),
    /// Field present but not of the expected shape
    InvalidField {
        field: &'static str,
        value: String,
    },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "invalid JSON: {}", e),
            Self::NotAnObject => write!(f, "message is not a JSON object"),
            Self::MissingType => write!(f, "missing 'type' field"),
            Self::UnknownType(t) => write!(f, "unknown message type: {}", t),
            Self::MissingField(field) => write!(f, "missing required field: {}", field),
            Self::InvalidField { field, value } => {
                write!(f, "invalid value for {}: {}", field, value)
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e.to_string())
    }
}
