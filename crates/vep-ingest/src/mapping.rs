//! Vendor header to canonical field mapping
//!
//! A [`MappingTable`] is external configuration keyed by
//! (vendor, jurisdiction, raw header). Keys are normalized on load and on
//! lookup so that `"Last  Name "` and `"last name"` are the same header.
//! A jurisdiction of `*` declares a vendor-wide entry that applies wherever
//! no jurisdiction-specific entry exists.
//!
//! [`VendorFieldMapper::plan_header`] turns one file's header row into a
//! [`ColumnPlan`] once; rows are then mapped positionally without any
//! further lookups.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use vep_common::{CanonicalField, CanonicalSchema, FieldValue};

use crate::error::{IngestError, Result, RowError, RowErrorKind};

/// Jurisdiction value marking a vendor-wide mapping entry
pub const ANY_JURISDICTION: &str = "*";

/// Lowercase, trim, collapse internal whitespace and drop a UTF-8 BOM
pub fn normalize_key(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// What to do with a header that has no mapping entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmappedColumnPolicy {
    /// Fail the file before anything is provisioned or written
    #[default]
    Strict,
    /// Drop the column and record one warning per distinct header
    Lenient,
}

impl UnmappedColumnPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnmappedColumnPolicy::Strict => "strict",
            UnmappedColumnPolicy::Lenient => "lenient",
        }
    }
}

impl std::fmt::Display for UnmappedColumnPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UnmappedColumnPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(UnmappedColumnPolicy::Strict),
            "lenient" | "drop" => Ok(UnmappedColumnPolicy::Lenient),
            other => Err(IngestError::config(format!(
                "unmapped column policy must be 'strict' or 'lenient', got '{other}'"
            ))),
        }
    }
}

/// One row of a mapping table as supplied by configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub vendor: String,
    pub jurisdiction: String,
    pub raw_header: String,
    pub canonical_field: String,
}

impl MappingEntry {
    pub fn new(
        vendor: impl Into<String>,
        jurisdiction: impl Into<String>,
        raw_header: impl Into<String>,
        canonical_field: impl Into<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            jurisdiction: jurisdiction.into(),
            raw_header: raw_header.into(),
            canonical_field: canonical_field.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VendorScope {
    vendor: String,
    jurisdiction: String,
}

impl VendorScope {
    fn new(vendor: &str, jurisdiction: &str) -> Self {
        Self {
            vendor: normalize_key(vendor),
            jurisdiction: normalize_key(jurisdiction),
        }
    }
}

/// Validated lookup table: normalized (vendor, jurisdiction, header) to a
/// position in the canonical schema
#[derive(Debug, Clone)]
pub struct MappingTable {
    schema: Arc<CanonicalSchema>,
    scopes: HashMap<VendorScope, HashMap<String, usize>>,
    len: usize,
}

impl MappingTable {
    /// Build a table, resolving every target against `schema`
    pub fn from_entries<I>(schema: Arc<CanonicalSchema>, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = MappingEntry>,
    {
        let mut scopes: HashMap<VendorScope, HashMap<String, usize>> = HashMap::new();
        let mut len = 0;

        for entry in entries {
            let target = entry.canonical_field.trim();
            let position = schema
                .position(target)
                .ok_or_else(|| IngestError::UnknownField(target.to_string()))?;

            let scope = VendorScope::new(&entry.vendor, &entry.jurisdiction);
            if scope.vendor.is_empty() || scope.jurisdiction.is_empty() {
                return Err(IngestError::InvalidMapping(format!(
                    "entry for header '{}' has an empty vendor or jurisdiction",
                    entry.raw_header
                )));
            }
            let header = normalize_key(&entry.raw_header);
            if header.is_empty() {
                return Err(IngestError::InvalidMapping(format!(
                    "entry for {}/{} has an empty raw header",
                    entry.vendor, entry.jurisdiction
                )));
            }

            let headers = scopes.entry(scope).or_default();
            match headers.get(&header) {
                Some(&existing) if existing != position => {
                    return Err(IngestError::MappingConflict {
                        vendor: entry.vendor,
                        jurisdiction: entry.jurisdiction,
                        raw_header: entry.raw_header,
                        existing: schema.fields()[existing].name().to_string(),
                        conflicting: target.to_string(),
                    });
                }
                Some(_) => {}
                None => {
                    headers.insert(header, position);
                    len += 1;
                }
            }
        }

        Ok(Self { schema, scopes, len })
    }

    /// Read `vendor,jurisdiction,raw_header,canonical_field` CSV with a header row
    pub fn from_csv_reader<R: Read>(schema: Arc<CanonicalSchema>, reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let entries = csv
            .deserialize::<MappingEntry>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_entries(schema, entries)
    }

    /// Parse a JSON array of mapping entries
    pub fn from_json_str(schema: Arc<CanonicalSchema>, json: &str) -> Result<Self> {
        let entries: Vec<MappingEntry> = serde_json::from_str(json)?;
        Self::from_entries(schema, entries)
    }

    /// Load a mapping file, choosing JSON or CSV by extension
    pub fn load(schema: Arc<CanonicalSchema>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let table = if is_json {
            Self::from_json_str(schema, &std::fs::read_to_string(path)?)?
        } else {
            Self::from_csv_reader(schema, std::fs::File::open(path)?)?
        };

        debug!(path = %path.display(), entries = table.len(), "Loaded mapping table");
        Ok(table)
    }

    pub fn schema(&self) -> &Arc<CanonicalSchema> {
        &self.schema
    }

    /// Schema position for a header, preferring jurisdiction-specific entries
    pub fn lookup(&self, vendor: &str, jurisdiction: &str, raw_header: &str) -> Option<usize> {
        let header = normalize_key(raw_header);
        let specific = VendorScope::new(vendor, jurisdiction);
        let vendor_wide = VendorScope::new(vendor, ANY_JURISDICTION);

        [specific, vendor_wide]
            .iter()
            .find_map(|scope| self.scopes.get(scope)?.get(&header).copied())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Resolves header rows against a mapping table under one policy
#[derive(Debug, Clone)]
pub struct VendorFieldMapper {
    table: Arc<MappingTable>,
    policy: UnmappedColumnPolicy,
}

impl VendorFieldMapper {
    pub fn new(table: Arc<MappingTable>, policy: UnmappedColumnPolicy) -> Self {
        Self { table, policy }
    }

    pub fn schema(&self) -> &Arc<CanonicalSchema> {
        self.table.schema()
    }

    pub fn policy(&self) -> UnmappedColumnPolicy {
        self.policy
    }

    /// Canonical field per input column, in input order; `None` marks a
    /// column that lenient mode drops
    pub fn map_header<S: AsRef<str>>(
        &self,
        vendor: &str,
        jurisdiction: &str,
        raw_headers: &[S],
    ) -> Result<Vec<Option<CanonicalField>>> {
        let plan = self.plan_header(vendor, jurisdiction, raw_headers)?;
        Ok(plan
            .targets()
            .iter()
            .map(|target| target.map(|position| self.schema().fields()[position].clone()))
            .collect())
    }

    /// Compile a header row into a reusable [`ColumnPlan`]
    pub fn plan_header<S: AsRef<str>>(
        &self,
        vendor: &str,
        jurisdiction: &str,
        raw_headers: &[S],
    ) -> Result<ColumnPlan> {
        let schema = self.schema();
        let mut targets = Vec::with_capacity(raw_headers.len());
        let mut claimed: HashMap<usize, usize> = HashMap::new();
        let mut unmapped: HashSet<String> = HashSet::new();
        let mut warnings = Vec::new();

        for (column, raw) in raw_headers.iter().enumerate() {
            let raw = raw.as_ref();

            let Some(position) = self.table.lookup(vendor, jurisdiction, raw) else {
                if self.policy == UnmappedColumnPolicy::Strict {
                    return Err(IngestError::UnmappedColumn {
                        vendor: vendor.to_string(),
                        jurisdiction: jurisdiction.to_string(),
                        raw_header: raw.to_string(),
                    });
                }
                if unmapped.insert(normalize_key(raw)) {
                    warn!(raw_header = %raw, vendor, jurisdiction, "Dropping unmapped column");
                    warnings.push(format!("dropped unmapped column '{raw}'"));
                }
                targets.push(None);
                continue;
            };

            if let Some(&first) = claimed.get(&position) {
                let field = schema.fields()[position].name();
                let first = raw_headers[first].as_ref();
                if self.policy == UnmappedColumnPolicy::Strict {
                    return Err(IngestError::DuplicateColumn {
                        field: field.to_string(),
                        first: first.to_string(),
                        second: raw.to_string(),
                    });
                }
                warn!(raw_header = %raw, field, kept = %first, "Dropping duplicate column");
                warnings.push(format!(
                    "dropped column '{raw}': '{first}' already maps to '{field}'"
                ));
                targets.push(None);
                continue;
            }

            claimed.insert(position, column);
            targets.push(Some(position));
        }

        if let Some(field) = schema
            .fields()
            .iter()
            .enumerate()
            .find(|(position, field)| !field.is_nullable() && !claimed.contains_key(position))
            .map(|(_, field)| field)
        {
            return Err(IngestError::MissingRequiredColumn(field.name().to_string()));
        }

        debug!(
            vendor,
            jurisdiction,
            columns = raw_headers.len(),
            mapped = claimed.len(),
            "Planned header"
        );

        Ok(ColumnPlan {
            schema: Arc::clone(schema),
            targets,
            warnings,
        })
    }
}

/// Column index to schema position, compiled once per file
#[derive(Debug, Clone)]
pub struct ColumnPlan {
    schema: Arc<CanonicalSchema>,
    targets: Vec<Option<usize>>,
    warnings: Vec<String>,
}

impl ColumnPlan {
    pub fn schema(&self) -> &Arc<CanonicalSchema> {
        &self.schema
    }

    /// Schema position per input column
    pub fn targets(&self) -> &[Option<usize>] {
        &self.targets
    }

    /// Number of columns every data row must have
    pub fn width(&self) -> usize {
        self.targets.len()
    }

    pub fn mapped_columns(&self) -> usize {
        self.targets.iter().flatten().count()
    }

    /// Warnings produced while planning (dropped columns)
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Map one data row to schema-ordered values; unmapped fields are `Null`
    pub fn map_row<S: AsRef<str>>(&self, fields: &[S], line: u64) -> std::result::Result<Vec<FieldValue>, RowError> {
        if fields.len() != self.width() {
            return Err(RowError::new(
                line,
                RowErrorKind::ColumnCount,
                format!("expected {} fields, found {}", self.width(), fields.len()),
            ));
        }

        let mut values = vec![FieldValue::Null; self.schema.len()];
        for (raw, target) in fields.iter().zip(&self.targets) {
            if let Some(position) = *target {
                values[position] = self.schema.fields()[position]
                    .coerce(raw.as_ref())
                    .map_err(|err| RowError::new(line, RowErrorKind::Coercion, err.to_string()))?;
            }
        }

        Ok(values)
    }
}
