//! Relation identity, naming and column layout
//!
//! Every (namespace, vendor, jurisdiction) triple owns one physical table,
//! `"<namespace>"."<vendor_slug>__<jurisdiction_slug>"`, holding the
//! canonical columns in schema order followed by the provenance columns.
//! Slugs never contain `__` or start or end with `_`, so the separator is
//! unambiguous and distinct triples never share a table.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use vep_common::schema::{is_valid_identifier, MAX_IDENTIFIER_LEN};
use vep_common::{CanonicalSchema, SemanticType};

use crate::error::{IngestError, Result};

/// Joins the vendor and jurisdiction slugs of a table name
const SLUG_SEPARATOR: &str = "__";

/// Lowercase, with each run of non-alphanumeric characters folded to `_`
/// and leading/trailing `_` removed; the result never contains `__`
pub fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }

    slug
}

/// Caller-supplied identity of a dataset relation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationId {
    pub namespace: String,
    pub vendor: String,
    pub jurisdiction: String,
}

impl RelationId {
    pub fn new(
        namespace: impl Into<String>,
        vendor: impl Into<String>,
        jurisdiction: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            vendor: vendor.into(),
            jurisdiction: jurisdiction.into(),
        }
    }

    /// Deterministic physical name for this identity
    pub fn relation_name(&self) -> Result<RelationName> {
        let namespace = self.namespace.trim();
        if !is_valid_identifier(namespace) {
            return Err(IngestError::InvalidIdentifier(format!(
                "namespace '{}' must be a lowercase identifier",
                self.namespace
            )));
        }

        let vendor = slugify(&self.vendor);
        let jurisdiction = slugify(&self.jurisdiction);
        if vendor.is_empty() || jurisdiction.is_empty() {
            return Err(IngestError::InvalidIdentifier(format!(
                "vendor '{}' and jurisdiction '{}' must contain letters or digits",
                self.vendor, self.jurisdiction
            )));
        }

        let table = format!("{vendor}{SLUG_SEPARATOR}{jurisdiction}");
        if table.len() > MAX_IDENTIFIER_LEN {
            return Err(IngestError::InvalidIdentifier(format!(
                "relation name '{table}' exceeds {MAX_IDENTIFIER_LEN} bytes"
            )));
        }

        Ok(RelationName {
            namespace: namespace.to_string(),
            table,
        })
    }
}

impl std::fmt::Display for RelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.vendor, self.jurisdiction)
    }
}

/// Physical `"namespace"."table"` name; both parts are plain identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationName {
    namespace: String,
    table: String,
}

impl RelationName {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Double-quoted form for SQL text
    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.namespace, self.table)
    }
}

impl std::fmt::Display for RelationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// SQL column type of a relation column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    BigInt,
    Date,
    Boolean,
    TimestampTz,
}

impl ColumnType {
    pub fn for_semantic(semantic_type: SemanticType) -> Self {
        match semantic_type {
            SemanticType::Text => ColumnType::Text,
            SemanticType::Integer => ColumnType::BigInt,
            SemanticType::Date => ColumnType::Date,
            SemanticType::Boolean => ColumnType::Boolean,
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Date => "DATE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::TimestampTz => "TIMESTAMPTZ",
        }
    }

    /// Whether an existing column, described by its `information_schema`
    /// `data_type`, can hold values of this type
    pub fn accepts(&self, data_type: &str) -> bool {
        let data_type = data_type.trim().to_lowercase();
        match self {
            ColumnType::Text => matches!(data_type.as_str(), "text" | "character varying"),
            ColumnType::BigInt => matches!(data_type.as_str(), "bigint" | "numeric"),
            ColumnType::Date => data_type == "date",
            ColumnType::Boolean => data_type == "boolean",
            ColumnType::TimestampTz => data_type == "timestamp with time zone",
        }
    }
}

/// One column of a relation as it should exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
        }
    }

    /// `"name" TYPE [NOT NULL]`
    pub fn ddl(&self) -> String {
        let not_null = if self.nullable { "" } else { " NOT NULL" };
        format!("\"{}\" {}{}", self.name, self.column_type.sql(), not_null)
    }
}

/// One column as found in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

impl ExistingColumn {
    /// A nullable column
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Canonical columns in schema order, then the provenance columns
pub fn relation_columns(schema: &CanonicalSchema) -> Vec<ColumnDef> {
    let mut columns: Vec<ColumnDef> = schema
        .fields()
        .iter()
        .map(|field| {
            ColumnDef::new(
                field.name(),
                ColumnType::for_semantic(field.semantic_type()),
                field.is_nullable(),
            )
        })
        .collect();

    columns.extend([
        ColumnDef::new("source_vendor", ColumnType::Text, false),
        ColumnDef::new("source_jurisdiction", ColumnType::Text, false),
        ColumnDef::new("source_file", ColumnType::Text, false),
        ColumnDef::new("loaded_at", ColumnType::TimestampTz, false),
    ]);
    columns
}

/// Columns `expected` needs that `existing` lacks, types incompatibly, or
/// declares `NOT NULL` where canonical values may be null
pub fn find_drift(expected: &[ColumnDef], existing: &[ExistingColumn]) -> (Vec<String>, Vec<String>) {
    let mut missing = Vec::new();
    let mut conflicting = Vec::new();

    for column in expected {
        match existing.iter().find(|found| found.name == column.name) {
            None => missing.push(column.name.clone()),
            Some(found) if !column.column_type.accepts(&found.data_type) => {
                conflicting.push(format!(
                    "{} (expected {}, found {})",
                    column.name,
                    column.column_type.sql(),
                    found.data_type
                ));
            }
            Some(found) if column.nullable && !found.nullable => {
                conflicting.push(format!("{} (expected nullable, found NOT NULL)", column.name));
            }
            Some(_) => {}
        }
    }

    (missing, conflicting)
}

/// A relation verified to match the canonical schema; cheap to clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationHandle {
    name: RelationName,
    schema: Arc<CanonicalSchema>,
}

impl RelationHandle {
    pub fn new(name: RelationName, schema: Arc<CanonicalSchema>) -> Self {
        Self { name, schema }
    }

    pub fn name(&self) -> &RelationName {
        &self.name
    }

    pub fn schema(&self) -> &Arc<CanonicalSchema> {
        &self.schema
    }

    pub fn columns(&self) -> Vec<ColumnDef> {
        relation_columns(&self.schema)
    }
}
