//! In-process relation store
//!
//! Behaves like the PostgreSQL store for the engine's purposes: relations
//! have columns, batches land all-or-nothing, and a cancelled write leaves
//! nothing behind. Faults and latency can be injected for tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{ProvenanceFilter, RelationStore};
use crate::error::{IngestError, Result};
use crate::record::{IngestionBatch, IngestionRecord};
use crate::relation::{ColumnDef, ExistingColumn, RelationHandle, RelationName};

/// Failure returned by an upcoming `write_batch` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// Retryable, like a dropped connection
    Transient,
    /// Not retryable, like a constraint violation
    Fatal,
}

impl WriteFault {
    fn into_error(self) -> IngestError {
        match self {
            WriteFault::Transient => IngestError::TransientStorage(sqlx::Error::PoolTimedOut),
            WriteFault::Fatal => {
                IngestError::Storage(sqlx::Error::Protocol("injected write failure".to_string()))
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryRelation {
    columns: Vec<ExistingColumn>,
    rows: Vec<IngestionRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    relations: Mutex<HashMap<RelationName, MemoryRelation>>,
    faults: Mutex<VecDeque<WriteFault>>,
    write_delay: Mutex<Option<Duration>>,
    create_delay: Mutex<Option<Duration>>,
    create_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a relation that already exists with the given columns
    pub fn with_relation(self, name: RelationName, columns: Vec<ExistingColumn>) -> Self {
        lock(&self.relations).insert(
            name,
            MemoryRelation {
                columns,
                rows: Vec::new(),
            },
        );
        self
    }

    /// Make the next `count` writes fail with `fault`
    pub fn fail_next_writes(&self, fault: WriteFault, count: usize) {
        lock(&self.faults).extend(std::iter::repeat_n(fault, count));
    }

    /// Delay every write by `delay` before it commits
    pub fn set_write_delay(&self, delay: Duration) {
        *lock(&self.write_delay) = Some(delay);
    }

    /// Delay every create call, widening any check-then-create race
    pub fn set_create_delay(&self, delay: Duration) {
        *lock(&self.create_delay) = Some(delay);
    }

    /// Number of `create` calls received
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `write_batch` calls received, including failed ones
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Committed rows in a relation; 0 if it does not exist
    pub fn row_count(&self, name: &RelationName) -> usize {
        lock(&self.relations)
            .get(name)
            .map(|relation| relation.rows.len())
            .unwrap_or(0)
    }

    pub fn relation_names(&self) -> Vec<RelationName> {
        let mut names: Vec<_> = lock(&self.relations).keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RelationStore for MemoryStore {
    async fn describe(&self, name: &RelationName) -> Result<Option<Vec<ExistingColumn>>> {
        Ok(lock(&self.relations)
            .get(name)
            .map(|relation| relation.columns.clone()))
    }

    async fn create(&self, name: &RelationName, columns: &[ColumnDef]) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&self.create_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        lock(&self.relations)
            .entry(name.clone())
            .or_insert_with(|| MemoryRelation {
                columns: columns
                    .iter()
                    .map(|column| {
                        let existing = ExistingColumn::new(&column.name, data_type(column));
                        if column.nullable {
                            existing
                        } else {
                            existing.not_null()
                        }
                    })
                    .collect(),
                rows: Vec::new(),
            });
        Ok(())
    }

    async fn write_batch(&self, handle: &RelationHandle, batch: &IngestionBatch) -> Result<u64> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);

        let fault = lock(&self.faults).pop_front();
        if let Some(fault) = fault {
            return Err(fault.into_error());
        }

        let delay = *lock(&self.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Commit point: nothing above this line has touched the relation
        let mut relations = lock(&self.relations);
        let relation = relations.get_mut(handle.name()).ok_or_else(|| {
            IngestError::Storage(sqlx::Error::Protocol(format!(
                "relation {} does not exist",
                handle.name()
            )))
        })?;
        relation.rows.extend(batch.records().iter().cloned());
        Ok(batch.len() as u64)
    }

    async fn read_rows(
        &self,
        handle: &RelationHandle,
        filter: &ProvenanceFilter,
    ) -> Result<Vec<IngestionRecord>> {
        Ok(lock(&self.relations)
            .get(handle.name())
            .map(|relation| {
                relation
                    .rows
                    .iter()
                    .filter(|record| filter.matches(record.provenance()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// `information_schema` spelling of a column type
fn data_type(column: &ColumnDef) -> &'static str {
    use crate::relation::ColumnType;

    match column.column_type {
        ColumnType::Text => "text",
        ColumnType::BigInt => "bigint",
        ColumnType::Date => "date",
        ColumnType::Boolean => "boolean",
        ColumnType::TimestampTz => "timestamp with time zone",
    }
}
