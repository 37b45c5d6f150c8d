//! Shared helpers for vep-ingest integration tests
//!
//! Builds pipelines over a [`MemoryStore`] and writes CSV fixtures to
//! temporary directories.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use vep_common::CanonicalSchema;
use vep_ingest::{
    IngestConfig, IngestionPipeline, MappingEntry, MappingTable, MemoryStore, RelationStore,
    TableProvisioner, UnmappedColumnPolicy, VendorFieldMapper,
};

pub const NAMESPACE: &str = "voterfile";

/// Directory of checked-in fixture files
pub fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

pub fn voter_schema() -> Arc<CanonicalSchema> {
    Arc::new(CanonicalSchema::voter_file())
}

/// Mapping table from `fixtures/mappings.csv`
pub fn fixture_mappings(schema: Arc<CanonicalSchema>) -> Arc<MappingTable> {
    Arc::new(MappingTable::load(schema, fixtures_dir().join("mappings.csv")).unwrap())
}

/// Minimal Ryan Data / TX table: Voter ID, Last Name, DOB
pub fn ryan_data_mappings(schema: Arc<CanonicalSchema>) -> Arc<MappingTable> {
    Arc::new(
        MappingTable::from_entries(
            schema,
            vec![
                MappingEntry::new("Ryan Data", "TX", "Voter ID", "voter_id"),
                MappingEntry::new("Ryan Data", "TX", "Last Name", "last_name"),
                MappingEntry::new("Ryan Data", "TX", "DOB", "date_of_birth"),
            ],
        )
        .unwrap(),
    )
}

/// Config with small batches and fast retries
pub fn test_config() -> IngestConfig {
    IngestConfig {
        batch_size: 2,
        unmapped_columns: UnmappedColumnPolicy::Strict,
        max_flush_retries: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        read_ahead_rows: 4,
        max_concurrent_files: 2,
        ..IngestConfig::default()
    }
}

pub struct TestHarness {
    pub store: Arc<MemoryStore>,
    pub provisioner: Arc<TableProvisioner>,
    pub pipeline: Arc<IngestionPipeline>,
    pub dir: TempDir,
}

impl TestHarness {
    pub fn new(table: Arc<MappingTable>, config: IngestConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), table, config)
    }

    pub fn with_store(store: Arc<MemoryStore>, table: Arc<MappingTable>, config: IngestConfig) -> Self {
        let dyn_store: Arc<dyn RelationStore> = store.clone();
        let provisioner = Arc::new(TableProvisioner::new(dyn_store));
        let mapper = Arc::new(VendorFieldMapper::new(table, config.unmapped_columns));
        let pipeline = Arc::new(IngestionPipeline::new(mapper, Arc::clone(&provisioner), config));

        Self {
            store,
            provisioner,
            pipeline,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    /// Write `contents` to a file in the harness's temp directory
    pub fn write_csv(&self, name: &str, contents: &str) -> PathBuf {
        write_bytes(self.dir.path(), name, contents.as_bytes())
    }

    pub fn write_csv_bytes(&self, name: &str, contents: &[u8]) -> PathBuf {
        write_bytes(self.dir.path(), name, contents)
    }
}

fn write_bytes(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// CSV with `rows` data rows for the Ryan Data / TX mapping
pub fn ryan_data_csv(rows: usize) -> String {
    let mut csv = String::from("Voter ID,Last Name,DOB\n");
    for row in 0..rows {
        csv.push_str(&format!("TX{row:05},Name{row},1980-01-05\n"));
    }
    csv
}
