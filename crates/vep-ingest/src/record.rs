//! Mapped records and write batches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vep_common::{CanonicalSchema, FieldValue};

/// Where a row came from; stamped into the provenance columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub vendor: String,
    pub jurisdiction: String,
    pub source_file: String,
    /// Fixed once per file load so all of its rows share it
    pub loaded_at: DateTime<Utc>,
}

impl Provenance {
    pub fn new(
        vendor: impl Into<String>,
        jurisdiction: impl Into<String>,
        source_file: impl Into<String>,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            jurisdiction: jurisdiction.into(),
            source_file: source_file.into(),
            loaded_at,
        }
    }
}

/// One row in canonical form: a value for every schema field, in schema order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionRecord {
    values: Vec<FieldValue>,
    provenance: Arc<Provenance>,
}

impl IngestionRecord {
    pub fn new(values: Vec<FieldValue>, provenance: Arc<Provenance>) -> Self {
        Self { values, provenance }
    }

    /// Values aligned with [`CanonicalSchema::fields`]
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Value of a canonical field by name
    pub fn get<'a>(&'a self, schema: &CanonicalSchema, field: &str) -> Option<&'a FieldValue> {
        schema
            .position(field)
            .and_then(|position| self.values.get(position))
    }
}

/// Records written together in one transaction
#[derive(Debug, Default)]
pub struct IngestionBatch {
    records: Vec<IngestionRecord>,
}

impl IngestionBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: IngestionRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[IngestionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl FromIterator<IngestionRecord> for IngestionBatch {
    fn from_iter<I: IntoIterator<Item = IngestionRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}
