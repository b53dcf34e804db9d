//! Error types for schema handling

use thiserror::Error;

/// Result type alias for schema operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Errors raised while parsing or validating an array schema
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Malformed schema '{schema}': {reason}")]
    Malformed { schema: String, reason: String },

    #[error("Schema declares no attributes: {0}")]
    NoAttributes(String),

    #[error("Schema must declare exactly one dimension, found {count}: {schema}")]
    DimensionCount { schema: String, count: usize },

    #[error("Invalid schema pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl SchemaError {
    /// Create a malformed-schema error
    pub fn malformed(schema: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            schema: schema.into(),
            reason: reason.into(),
        }
    }
}
