//! Error types for canonical schema handling

use thiserror::Error;

use crate::schema::SemanticType;

/// Result type alias for schema operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Errors raised while defining or querying a canonical schema
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Unknown canonical field: {0}")]
    UnknownField(String),

    #[error("Unknown semantic type: {0}")]
    UnknownType(String),

    #[error("Canonical field '{0}' is defined more than once")]
    DuplicateField(String),

    #[error("Invalid canonical field name '{0}': expected a lowercase identifier of at most 63 bytes")]
    InvalidFieldName(String),

    #[error("Canonical field name '{0}' collides with a provenance column")]
    ReservedFieldName(String),

    #[error("Canonical schema must define at least one field")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema definition is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raised when a raw text value cannot be stored in a canonical field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoercionError {
    #[error("field '{field}' is not nullable but the value is empty")]
    NullValue { field: String },

    #[error("field '{field}' expects {expected}, got '{value}'")]
    InvalidValue {
        field: String,
        expected: SemanticType,
        value: String,
    },
}
