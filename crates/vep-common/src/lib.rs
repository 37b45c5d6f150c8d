//! VEP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and ambient infrastructure for the VEP loader workspace.
//!
//! # Overview
//!
//! - **Schema**: the canonical, vendor-independent field vocabulary
//!   ([`CanonicalSchema`], [`CanonicalField`], [`SemanticType`])
//! - **Values**: typed scalars and raw-text coercion ([`FieldValue`])
//! - **Errors**: schema and coercion error types
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```
//! use vep_common::{CanonicalSchema, FieldValue};
//!
//! let schema = CanonicalSchema::voter_file();
//! let dob = schema.resolve("date_of_birth").unwrap();
//! let value = dob.coerce("01/05/1980").unwrap();
//! assert!(matches!(value, FieldValue::Date(_)));
//! ```

pub mod error;
pub mod logging;
pub mod schema;
pub mod value;

// Re-export commonly used types
pub use error::{CoercionError, Result, SchemaError};
pub use schema::{CanonicalField, CanonicalSchema, SemanticType, RESERVED_COLUMN_NAMES};
pub use value::FieldValue;
