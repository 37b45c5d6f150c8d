//! Relation storage interface
//!
//! Provides the trait the provisioner and pipelines persist through.
//! [`PgRelationStore`] talks to PostgreSQL; [`MemoryStore`] keeps relations
//! in process for tests and dry runs.

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{IngestionBatch, IngestionRecord, Provenance};
use crate::relation::{ColumnDef, ExistingColumn, RelationHandle, RelationName};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, WriteFault};
pub use postgres::PgRelationStore;

/// Storage backend for dataset relations
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Columns of an existing relation, or `None` if it does not exist
    async fn describe(&self, name: &RelationName) -> Result<Option<Vec<ExistingColumn>>>;

    /// Create the relation (and its namespace) if absent
    async fn create(&self, name: &RelationName, columns: &[ColumnDef]) -> Result<()>;

    /// Append a batch in a single transaction; returns rows written.
    ///
    /// Dropping the returned future before it resolves must leave no rows
    /// behind.
    async fn write_batch(&self, handle: &RelationHandle, batch: &IngestionBatch) -> Result<u64>;

    /// Rows whose provenance matches `filter`
    async fn read_rows(
        &self,
        handle: &RelationHandle,
        filter: &ProvenanceFilter,
    ) -> Result<Vec<IngestionRecord>>;
}

/// Selects rows by provenance columns; unset parts match anything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvenanceFilter {
    pub vendor: Option<String>,
    pub jurisdiction: Option<String>,
    pub source_file: Option<String>,
}

impl ProvenanceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn jurisdiction(mut self, jurisdiction: impl Into<String>) -> Self {
        self.jurisdiction = Some(jurisdiction.into());
        self
    }

    pub fn source_file(mut self, source_file: impl Into<String>) -> Self {
        self.source_file = Some(source_file.into());
        self
    }

    pub fn matches(&self, provenance: &Provenance) -> bool {
        fn part(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().is_none_or(|expected| expected == actual)
        }

        part(&self.vendor, &provenance.vendor)
            && part(&self.jurisdiction, &provenance.jurisdiction)
            && part(&self.source_file, &provenance.source_file)
    }
}
