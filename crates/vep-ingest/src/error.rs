//! Error types for the ingestion engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vep_common::SchemaError;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// File- and run-level ingestion errors
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Unknown canonical field: {0}")]
    UnknownField(String),

    #[error("Column '{raw_header}' has no mapping for vendor '{vendor}' in jurisdiction '{jurisdiction}'")]
    UnmappedColumn {
        vendor: String,
        jurisdiction: String,
        raw_header: String,
    },

    #[error("Columns '{first}' and '{second}' both map to canonical field '{field}'")]
    DuplicateColumn {
        field: String,
        first: String,
        second: String,
    },

    #[error("Required canonical field '{0}' is not present in the header")]
    MissingRequiredColumn(String),

    #[error(
        "Conflicting mappings for '{raw_header}' ({vendor}/{jurisdiction}): '{existing}' vs '{conflicting}'"
    )]
    MappingConflict {
        vendor: String,
        jurisdiction: String,
        raw_header: String,
        existing: String,
        conflicting: String,
    },

    #[error("Invalid mapping table: {0}")]
    InvalidMapping(String),

    #[error("Relation {relation} does not match the canonical schema (missing: {missing:?}, conflicting: {conflicting:?})")]
    SchemaDrift {
        relation: String,
        missing: Vec<String>,
        conflicting: Vec<String>,
    },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("File has no header row: {}", .0.display())]
    EmptyFile(PathBuf),

    #[error("Row error rate exceeded: {rejected} of {read} rows rejected (limit {max_rate})")]
    ErrorThresholdExceeded { rejected: u64, read: u64, max_rate: f64 },

    #[error("Transient storage error: {0}")]
    TransientStorage(#[source] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("Batch flush timed out after {0:?}")]
    FlushTimeout(Duration),

    #[error("Batch flush failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<IngestError>,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(#[source] SchemaError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reader task failed: {0}")]
    ReaderTask(String),

    #[error("Ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    /// Whether a flush that failed with this error may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::TransientStorage(_) | IngestError::FlushTimeout(_))
    }

    /// Whether this error must stop the remaining files of a run
    pub fn aborts_run(&self) -> bool {
        matches!(self, IngestError::SchemaDrift { .. } | IngestError::Cancelled)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            IngestError::TransientStorage(err)
        } else {
            IngestError::Storage(err)
        }
    }
}

impl From<SchemaError> for IngestError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::UnknownField(name) => IngestError::UnknownField(name),
            other => IngestError::Schema(other),
        }
    }
}

/// SQLSTATE codes worth retrying: serialization failure, deadlock, shutdown
const TRANSIENT_SQLSTATES: [&str; 5] = ["40001", "40P01", "57P01", "57P02", "57P03"];

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&code.as_ref()))
            .unwrap_or(false),
        _ => false,
    }
}

/// Why a single row was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    /// Field count differs from the header
    ColumnCount,
    /// A value could not be coerced to its canonical type
    Coercion,
    /// The CSV reader could not parse the row
    Malformed,
}

impl RowErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowErrorKind::ColumnCount => "column_count",
            RowErrorKind::Coercion => "coercion",
            RowErrorKind::Malformed => "malformed",
        }
    }
}

/// A rejected row; counted against the file's error rate, never fatal alone
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("line {line}: {} ({message})", kind.as_str())]
pub struct RowError {
    pub line: u64,
    pub kind: RowErrorKind,
    pub message: String,
}

impl RowError {
    pub fn new(line: u64, kind: RowErrorKind, message: impl Into<String>) -> Self {
        Self {
            line,
            kind,
            message: message.into(),
        }
    }
}
