//! VEP Ingest
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Streams vendor CSV files into per-vendor, per-jurisdiction relations
//! under the canonical schema.
//!
//! # Architecture
//!
//! ```text
//! IngestionRunCoordinator ── buffer_unordered ──► IngestionPipeline (per file)
//!                                                   │
//!           SourceReader (spawn_blocking) ──mpsc──► │
//!           VendorFieldMapper ─► ColumnPlan         │
//!           TableProvisioner ─► RelationHandle      │
//!                                                   ▼
//!                                         RelationStore::write_batch
//!                                       (PgRelationStore / MemoryStore)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use vep_common::CanonicalSchema;
//! use vep_ingest::{
//!     IngestConfig, IngestionPipeline, MappingTable, MemoryStore, SourceFile,
//!     TableProvisioner, VendorFieldMapper,
//! };
//!
//! # async fn example() -> vep_ingest::Result<()> {
//! let config = IngestConfig::default();
//! let schema = Arc::new(CanonicalSchema::voter_file());
//! let table = MappingTable::load(schema, "mappings.csv")?;
//! let mapper = VendorFieldMapper::new(Arc::new(table), config.unmapped_columns);
//! let provisioner = TableProvisioner::new(Arc::new(MemoryStore::new()));
//! let pipeline = IngestionPipeline::new(Arc::new(mapper), Arc::new(provisioner), config);
//!
//! let file = SourceFile::new("texas.csv", "Ryan Data", "TX", "voterfile");
//! let summary = pipeline
//!     .ingest_file(&file, &CancellationToken::new())
//!     .await
//!     .map_err(|failure| failure.error)?;
//! println!("{} rows written", summary.rows_written);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod mapping;
pub mod pipeline;
pub mod provision;
pub mod record;
pub mod relation;
pub mod source;
pub mod store;

pub use config::IngestConfig;
pub use coordinator::{FileOutcome, IngestionRunCoordinator, RunSummary, RunTotals};
pub use error::{IngestError, Result, RowError, RowErrorKind};
pub use mapping::{ColumnPlan, MappingEntry, MappingTable, UnmappedColumnPolicy, VendorFieldMapper};
pub use pipeline::{
    FileSummary, IngestionPipeline, PipelineFailure, PipelineState, ProgressEvent, SourceFile,
};
pub use provision::TableProvisioner;
pub use record::{IngestionBatch, IngestionRecord, Provenance};
pub use relation::{RelationHandle, RelationId, RelationName};
pub use store::{MemoryStore, PgRelationStore, ProvenanceFilter, RelationStore, WriteFault};
