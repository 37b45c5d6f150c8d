//! Typed scalar values stored in canonical fields

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::schema::SemanticType;

/// Value of one canonical field in one record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    Boolean(bool),
}

/// Date layouts seen across vendor files, tried in order
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"];

impl FieldValue {
    /// Parse an already-trimmed, non-empty value as `semantic_type`
    pub fn parse(semantic_type: SemanticType, raw: &str) -> Option<Self> {
        match semantic_type {
            SemanticType::Text => Some(FieldValue::Text(raw.to_string())),
            SemanticType::Integer => parse_integer(raw).map(FieldValue::Integer),
            SemanticType::Date => parse_date(raw).map(FieldValue::Date),
            SemanticType::Boolean => parse_boolean(raw).map(FieldValue::Boolean),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Type carried by this value; `None` for `Null`
    pub fn semantic_type(&self) -> Option<SemanticType> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(_) => Some(SemanticType::Text),
            FieldValue::Integer(_) => Some(SemanticType::Integer),
            FieldValue::Date(_) => Some(SemanticType::Date),
            FieldValue::Boolean(_) => Some(SemanticType::Boolean),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            FieldValue::Text(text) => f.write_str(text),
            FieldValue::Integer(value) => write!(f, "{value}"),
            FieldValue::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            FieldValue::Boolean(value) => write!(f, "{value}"),
        }
    }
}

/// Plain integers, or integers with `,` thousands separators
fn parse_integer(raw: &str) -> Option<i64> {
    if let Ok(value) = raw.parse::<i64>() {
        return Some(value);
    }

    let (sign, digits) = match raw.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", raw.strip_prefix('+').unwrap_or(raw)),
    };

    let mut groups = digits.split(',');
    let leading = groups.next()?;
    if leading.is_empty() || leading.len() > 3 || !leading.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mut joined = format!("{sign}{leading}");
    let mut grouped = false;
    for group in groups {
        if group.len() != 3 || !group.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        joined.push_str(group);
        grouped = true;
    }

    if grouped {
        joined.parse().ok()
    } else {
        None
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let year = raw[0..4].parse().ok()?;
        let month = raw[4..6].parse().ok()?;
        let day = raw[6..8].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

fn parse_boolean(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}
