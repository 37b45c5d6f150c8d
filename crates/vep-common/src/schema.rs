//! Canonical schema definitions
//!
//! The canonical schema is the vendor-independent vocabulary every ingested
//! file is mapped into. It is identical across vendors and jurisdictions so
//! downstream queries can treat all provisioned relations uniformly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{CoercionError, Result, SchemaError};
use crate::value::FieldValue;

/// Column names appended to every relation to record where a row came from.
///
/// Canonical fields may not reuse these names.
pub const RESERVED_COLUMN_NAMES: [&str; 4] = [
    "source_vendor",
    "source_jurisdiction",
    "source_file",
    "loaded_at",
];

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Semantic type of a canonical field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Text,
    Integer,
    Date,
    Boolean,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Text => "text",
            SemanticType::Integer => "integer",
            SemanticType::Date => "date",
            SemanticType::Boolean => "boolean",
        }
    }
}

impl std::fmt::Display for SemanticType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SemanticType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "string" => Ok(SemanticType::Text),
            "integer" | "int" => Ok(SemanticType::Integer),
            "date" => Ok(SemanticType::Date),
            "boolean" | "bool" => Ok(SemanticType::Boolean),
            other => Err(SchemaError::UnknownType(other.to_string())),
        }
    }
}

fn default_nullable() -> bool {
    true
}

/// One normalized field definition. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalField {
    name: String,
    #[serde(alias = "type")]
    semantic_type: SemanticType,
    #[serde(default = "default_nullable")]
    nullable: bool,
}

impl CanonicalField {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            semantic_type,
            nullable,
        }
    }

    /// Shorthand for a nullable field
    pub fn optional(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self::new(name, semantic_type, true)
    }

    /// Shorthand for a NOT NULL field
    pub fn required(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self::new(name, semantic_type, false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn semantic_type(&self) -> SemanticType {
        self.semantic_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// Coerce a raw CSV value into this field's type.
    ///
    /// Surrounding whitespace is ignored and an empty value is `Null`, which
    /// non-nullable fields reject.
    pub fn coerce(&self, raw: &str) -> std::result::Result<FieldValue, CoercionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return if self.nullable {
                Ok(FieldValue::Null)
            } else {
                Err(CoercionError::NullValue {
                    field: self.name.clone(),
                })
            };
        }

        FieldValue::parse(self.semantic_type, trimmed).ok_or_else(|| {
            CoercionError::InvalidValue {
                field: self.name.clone(),
                expected: self.semantic_type,
                value: trimmed.to_string(),
            }
        })
    }
}

/// On-disk shape of a schema definition file
#[derive(Debug, Deserialize)]
struct SchemaFile {
    fields: Vec<CanonicalField>,
}

/// The ordered, validated set of canonical fields
#[derive(Debug, Clone)]
pub struct CanonicalSchema {
    fields: Vec<CanonicalField>,
    positions: HashMap<String, usize>,
}

impl PartialEq for CanonicalSchema {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for CanonicalSchema {}

impl CanonicalSchema {
    /// Build a schema, rejecting empty, duplicate, malformed or reserved names
    pub fn new(fields: Vec<CanonicalField>) -> Result<Self> {
        if fields.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut positions = HashMap::with_capacity(fields.len());
        for (position, field) in fields.iter().enumerate() {
            if !is_valid_identifier(&field.name) {
                return Err(SchemaError::InvalidFieldName(field.name.clone()));
            }
            if RESERVED_COLUMN_NAMES.contains(&field.name.as_str()) {
                return Err(SchemaError::ReservedFieldName(field.name.clone()));
            }
            if positions.insert(field.name.clone(), position).is_some() {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }

        Ok(Self { fields, positions })
    }

    /// Parse a JSON definition of the form `{"fields": [{"name", "type", "nullable"}]}`
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: SchemaFile = serde_json::from_str(json)?;
        Self::new(file.fields)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Built-in vocabulary for voter and target files.
    ///
    /// Every field is nullable: target files routinely omit registration
    /// details and voter files omit contact data.
    pub fn voter_file() -> Self {
        use SemanticType::{Boolean, Date, Integer, Text};

        let fields = [
            ("voter_id", Text),
            ("state_voter_id", Text),
            ("county_voter_id", Text),
            ("first_name", Text),
            ("middle_name", Text),
            ("last_name", Text),
            ("name_suffix", Text),
            ("date_of_birth", Date),
            ("age", Integer),
            ("gender", Text),
            ("race", Text),
            ("party", Text),
            ("registration_date", Date),
            ("voter_status", Text),
            ("residence_address", Text),
            ("residence_address_2", Text),
            ("residence_city", Text),
            ("residence_state", Text),
            ("residence_zip5", Text),
            ("residence_zip4", Text),
            ("mailing_address", Text),
            ("mailing_city", Text),
            ("mailing_state", Text),
            ("mailing_zip5", Text),
            ("county", Text),
            ("precinct", Text),
            ("congressional_district", Text),
            ("state_senate_district", Text),
            ("state_house_district", Text),
            ("phone", Text),
            ("cell_phone", Text),
            ("email", Text),
            ("permanent_absentee", Boolean),
            ("vote_history_count", Integer),
        ];

        let fields = fields
            .into_iter()
            .map(|(name, ty)| CanonicalField::optional(name, ty))
            .collect::<Vec<_>>();
        let positions = fields
            .iter()
            .enumerate()
            .map(|(position, field)| (field.name.clone(), position))
            .collect();

        Self { fields, positions }
    }

    /// Fields in definition order
    pub fn fields(&self) -> &[CanonicalField] {
        &self.fields
    }

    /// Look up a field by its canonical name
    pub fn resolve(&self, name: &str) -> Result<&CanonicalField> {
        self.position(name)
            .map(|position| &self.fields[position])
            .ok_or_else(|| SchemaError::UnknownField(name.to_string()))
    }

    /// Index of a field within [`fields`](Self::fields)
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// `[a-z_][a-z0-9_]*`, at most [`MAX_IDENTIFIER_LEN`] bytes
pub fn is_valid_identifier(name: &str) -> bool {
    let mut bytes = name.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_lowercase() || first == b'_')
        && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}
