//! loadcsv Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and utilities for the loadcsv workspace.
//!
//! # Overview
//!
//! - **Logging**: `tracing` subscriber setup shared by every binary
//! - **Schema**: the array schema model (`<attrs>[dims]`) and its parser
//! - **Errors**: schema-level error type
//!
//! # Example
//!
//! ```no_run
//! use loadcsv_common::schema::Schema;
//!
//! fn chunk_of(text: &str) -> loadcsv_common::Result<Option<u64>> {
//!     let schema: Schema = text.parse()?;
//!     Ok(schema.single_dimension()?.chunk_interval)
//! }
//! ```

pub mod error;
pub mod logging;
pub mod schema;

// Re-export commonly used types
pub use error::{Result, SchemaError};
pub use schema::{Attribute, Dimension, Schema};
