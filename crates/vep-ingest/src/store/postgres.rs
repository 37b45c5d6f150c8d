//! PostgreSQL relation store
//!
//! DDL and inserts are built at runtime because relation names and column
//! lists are only known once a header has been planned. Identifiers come
//! from [`RelationName`] and validated canonical field names, which are
//! plain `[a-z0-9_]` identifiers, so double-quoting them is sufficient.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::sync::Arc;
use tracing::debug;
use vep_common::{FieldValue, SemanticType, RESERVED_COLUMN_NAMES};

use super::{ProvenanceFilter, RelationStore};
use crate::error::Result;
use crate::record::{IngestionBatch, IngestionRecord, Provenance};
use crate::relation::{ColumnDef, ExistingColumn, RelationHandle, RelationName};

/// PostgreSQL caps a statement at 65535 bind parameters
const MAX_BIND_PARAMS: usize = 65_535;

/// duplicate_schema, duplicate_table, unique_violation (catalog race)
const ALREADY_EXISTS_CODES: [&str; 3] = ["42P06", "42P07", "23505"];

pub struct PgRelationStore {
    pool: PgPool,
}

impl PgRelationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one DDL statement, treating a concurrent creator's win as success
    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        match sqlx::query(sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db
                    .code()
                    .is_some_and(|code| ALREADY_EXISTS_CODES.contains(&code.as_ref())) =>
            {
                debug!(sql, "Object created concurrently");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn column_list(handle: &RelationHandle) -> String {
    handle
        .schema()
        .fields()
        .iter()
        .map(|field| field.name())
        .chain(RESERVED_COLUMN_NAMES)
        .map(|name| format!("\"{name}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_field<'args>(
    row: &mut Separated<'_, 'args, Postgres, &'static str>,
    semantic_type: SemanticType,
    value: &'args FieldValue,
) {
    match value {
        FieldValue::Text(text) => row.push_bind(text.as_str()),
        FieldValue::Integer(number) => row.push_bind(*number),
        FieldValue::Date(date) => row.push_bind(*date),
        FieldValue::Boolean(flag) => row.push_bind(*flag),
        FieldValue::Null => match semantic_type {
            SemanticType::Text => row.push_bind(None::<String>),
            SemanticType::Integer => row.push_bind(None::<i64>),
            SemanticType::Date => row.push_bind(None::<NaiveDate>),
            SemanticType::Boolean => row.push_bind(None::<bool>),
        },
    };
}

fn read_field(row: &PgRow, index: usize, semantic_type: SemanticType) -> Result<FieldValue> {
    let value = match semantic_type {
        SemanticType::Text => row.try_get::<Option<String>, _>(index)?.map(FieldValue::Text),
        SemanticType::Integer => row.try_get::<Option<i64>, _>(index)?.map(FieldValue::Integer),
        SemanticType::Date => row.try_get::<Option<NaiveDate>, _>(index)?.map(FieldValue::Date),
        SemanticType::Boolean => row.try_get::<Option<bool>, _>(index)?.map(FieldValue::Boolean),
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

#[async_trait]
impl RelationStore for PgRelationStore {
    async fn describe(&self, name: &RelationName) -> Result<Option<Vec<ExistingColumn>>> {
        let columns: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, is_nullable::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(name.namespace())
        .bind(name.table())
        .fetch_all(&self.pool)
        .await?;

        if columns.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            columns
                .into_iter()
                .map(|(name, data_type, is_nullable)| {
                    let column = ExistingColumn::new(name, data_type);
                    if is_nullable == "NO" {
                        column.not_null()
                    } else {
                        column
                    }
                })
                .collect(),
        ))
    }

    async fn create(&self, name: &RelationName, columns: &[ColumnDef]) -> Result<()> {
        self.execute_ddl(&format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", name.namespace()))
            .await?;

        let column_ddl = columns
            .iter()
            .map(ColumnDef::ddl)
            .collect::<Vec<_>>()
            .join(",\n    ");
        self.execute_ddl(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            name.qualified(),
            column_ddl
        ))
        .await
    }

    async fn write_batch(&self, handle: &RelationHandle, batch: &IngestionBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let schema = handle.schema();
        let params_per_row = schema.len() + RESERVED_COLUMN_NAMES.len();
        let rows_per_statement = (MAX_BIND_PARAMS / params_per_row).max(1);
        let insert = format!("INSERT INTO {} ({}) ", handle.name().qualified(), column_list(handle));

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for chunk in batch.records().chunks(rows_per_statement) {
            let mut query_builder: QueryBuilder<Postgres> = QueryBuilder::new(insert.as_str());

            query_builder.push_values(chunk, |mut b, record| {
                for (field, value) in schema.fields().iter().zip(record.values()) {
                    push_field(&mut b, field.semantic_type(), value);
                }
                let provenance = record.provenance();
                b.push_bind(provenance.vendor.as_str())
                    .push_bind(provenance.jurisdiction.as_str())
                    .push_bind(provenance.source_file.as_str())
                    .push_bind(provenance.loaded_at);
            });

            let result = query_builder.build().execute(&mut *tx).await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn read_rows(
        &self,
        handle: &RelationHandle,
        filter: &ProvenanceFilter,
    ) -> Result<Vec<IngestionRecord>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM {}
            WHERE ($1::text IS NULL OR source_vendor = $1)
              AND ($2::text IS NULL OR source_jurisdiction = $2)
              AND ($3::text IS NULL OR source_file = $3)
            "#,
            column_list(handle),
            handle.name().qualified()
        );

        let rows = sqlx::query(&sql)
            .bind(filter.vendor.as_deref())
            .bind(filter.jurisdiction.as_deref())
            .bind(filter.source_file.as_deref())
            .fetch_all(&self.pool)
            .await?;

        let schema = handle.schema();
        rows.iter()
            .map(|row| -> Result<IngestionRecord> {
                let values = schema
                    .fields()
                    .iter()
                    .enumerate()
                    .map(|(index, field)| read_field(row, index, field.semantic_type()))
                    .collect::<Result<Vec<_>>>()?;

                let provenance = Provenance::new(
                    row.try_get::<String, _>("source_vendor")?,
                    row.try_get::<String, _>("source_jurisdiction")?,
                    row.try_get::<String, _>("source_file")?,
                    row.try_get::<DateTime<Utc>, _>("loaded_at")?,
                );
                Ok(IngestionRecord::new(values, Arc::new(provenance)))
            })
            .collect()
    }
}
