//! Error types for the loader
//!
//! Every fatal condition of a run is a [`LoadError`]. The run controller logs it once,
//! performs the cleanup sweep, then maps it to exit status `2`. "No input" is not an
//! error and never appears here.

use loadcsv_common::SchemaError;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Error taxonomy of a load run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid options or schema; detected before any resource exists
    Configuration,
    /// Schema or topology could not be obtained from the store
    Resolution,
    /// A child process exited non-zero
    StageExecution,
    /// A channel or workspace could not be created or removed
    Resource,
    /// The loader received a termination signal
    Interrupted,
}

/// Comprehensive error type for a load run
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{}", with_diagnostics(.message, .stderr))]
    Resolution { message: String, stderr: String },

    #[error("Schema obtained from load array is corrupt: {0}")]
    CorruptSchema(String),

    #[error("{}", with_diagnostics(.message, .stderr))]
    Stage { message: String, stderr: String },

    #[error("{}", with_diagnostics(.message, .stderr))]
    Resource { message: String, stderr: String },

    #[error("Invalid schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interrupted by {0}.")]
    Interrupted(String),
}

fn with_diagnostics(message: &str, stderr: &str) -> String {
    let stderr = stderr.trim_end();
    if stderr.is_empty() {
        message.to_string()
    } else {
        format!("{message}\n{stderr}")
    }
}

impl LoadError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a resolution error carrying the failing command's standard error
    pub fn resolution(msg: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Resolution {
            message: msg.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a stage execution error carrying the failing command's standard error
    pub fn stage(msg: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Stage {
            message: msg.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a resource error for a channel or workspace path
    pub fn resource(action: &str, path: &Path, stderr: impl Into<String>) -> Self {
        Self::Resource {
            message: format!("Failed to {action}: \"{}\".", path.display()),
            stderr: stderr.into(),
        }
    }

    /// Taxonomy bucket of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            LoadError::Config(_) | LoadError::Schema(_) => ErrorCategory::Configuration,
            LoadError::Resolution { .. } | LoadError::CorruptSchema(_) => ErrorCategory::Resolution,
            LoadError::Stage { .. } => ErrorCategory::StageExecution,
            LoadError::Resource { .. } | LoadError::Io(_) => ErrorCategory::Resource,
            LoadError::Interrupted(_) => ErrorCategory::Interrupted,
        }
    }
}
