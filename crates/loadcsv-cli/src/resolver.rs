//! Schema and topology resolution
//!
//! The load schema comes either from `--load-schema` text or from the definition of the
//! named load array. Once known it is authoritative for the data layout: its chunk
//! interval and its type pattern replace whatever the command line said.

use crate::config::ArrayConfig;
use crate::context::RunContext;
use crate::error::{LoadError, Result};
use crate::exec::{SshOptions, TaskRegistry};
use crate::store::StoreClient;
use crate::topology::{HostAddresses, Topology};
use loadcsv_common::schema::find_schema_fragment;
use loadcsv_common::Schema;
use tracing::{debug, info, warn};

/// Resolve the load schema from its text, or from the definition of the load array.
///
/// Fails with a configuration error when neither is configured.
pub async fn resolve_schema(
    store: &StoreClient,
    registry: &mut TaskRegistry,
    arrays: &ArrayConfig,
) -> Result<Schema> {
    if let Some(text) = &arrays.load_schema {
        return Ok(text.parse()?);
    }
    let name = arrays.load_name.as_deref().ok_or_else(|| {
        LoadError::config("A load array name and/or load array schema must be provided.")
    })?;

    let definition = store.show_array(registry, name).await?;
    let fragment = find_schema_fragment(&definition)?
        .ok_or_else(|| LoadError::CorruptSchema(definition.trim_end().to_string()))?;
    debug!(schema = %fragment, "Load array schema");
    Ok(fragment.parse()?)
}

/// Let the resolved schema override chunk size and type pattern.
///
/// Fails unless the schema has exactly one dimension. A conflicting user-supplied type
/// pattern is reported once.
pub fn apply_schema(context: &mut RunContext, schema: &Schema) -> Result<()> {
    let dimension = schema.single_dimension()?;

    if let Some(chunk) = dimension.chunk_interval {
        if chunk == 0 {
            return Err(LoadError::config(format!(
                "Load array schema declares a chunk size of zero: {}",
                schema.text
            )));
        }
        if chunk != context.chunk_size {
            debug!(
                "Using chunk size of {} for load array based on load array schema definition.",
                chunk
            );
            context.chunk_size = chunk;
        }
    }

    info!("Computing type-pattern from load schema.");
    let pattern = schema.type_pattern();
    if let Some(old) = context.type_pattern.as_deref() {
        if old != pattern {
            warn!(
                "type pattern {} conflicts with load schema, using {} instead",
                old, pattern
            );
        }
    }
    context.type_pattern = Some(pattern);
    Ok(())
}

/// Fetch the instance set from the coordinator.
pub async fn resolve_topology(
    store: &StoreClient,
    registry: &mut TaskRegistry,
    context: &RunContext,
    hosts: &HostAddresses,
    ssh: &SshOptions,
) -> Result<Topology> {
    let listing = store.list_instances(registry).await?;
    let topology = Topology::from_listing(&listing, context, hosts, ssh)?;
    info!("This SciDB installation has {} instance(s).", topology.len());
    for instance in &topology {
        debug!(
            instance = instance.id,
            name = %instance.name,
            target = %instance.target,
            csv_fragment = %instance.csv_fragment.display(),
            dlf_fragment = %instance.dlf_fragment.display(),
            "Instance"
        );
    }
    Ok(topology)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{LoadConfig, StoreConfig};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn context(chunk_size: u64, type_pattern: Option<&str>) -> RunContext {
        RunContext::plan(
            &LoadConfig {
                chunk_size,
                type_pattern: type_pattern.map(String::from),
                ..Default::default()
            },
            "r",
        )
    }

    fn store_with_iquery(root: &Path, script: &str) -> StoreClient {
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = bin.join("iquery");
        std::fs::write(&tool, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        unreachable_store(root)
    }

    fn unreachable_store(root: &Path) -> StoreClient {
        StoreClient::new(&StoreConfig {
            root: root.to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn test_schema_overrides_chunk_and_pattern() {
        let schema: Schema = "<n:int64, s:string NULL>[i=0:*,1000,0]".parse().unwrap();
        let mut ctx = context(500_000, Some("NS"));
        apply_schema(&mut ctx, &schema).unwrap();
        assert_eq!(ctx.chunk_size, 1000);
        assert_eq!(ctx.type_pattern.as_deref(), Some("Ns"));
    }

    #[test]
    fn test_missing_chunk_keeps_configured_size() {
        let schema: Schema = "<v:int64>[i=0:*]".parse().unwrap();
        let mut ctx = context(42, None);
        apply_schema(&mut ctx, &schema).unwrap();
        assert_eq!(ctx.chunk_size, 42);
        assert_eq!(ctx.type_pattern.as_deref(), Some("N"));
    }

    #[test]
    fn test_multi_dimensional_schema_is_configuration_error() {
        let schema: Schema = "<v:int64>[i=0:*,10,0, j=0:9,10,0]".parse().unwrap();
        let err = apply_schema(&mut context(10, None), &schema).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
    }

    #[tokio::test]
    async fn test_explicit_schema_is_not_queried() {
        let store = unreachable_store(Path::new("/nonexistent"));
        let arrays = ArrayConfig {
            load_name: Some("A".into()),
            load_schema: Some("<v:int64>[i=0:*,10,0]".into()),
            ..Default::default()
        };
        let mut registry = TaskRegistry::new();
        let schema = resolve_schema(&store, &mut registry, &arrays).await.unwrap();
        assert_eq!(schema.type_pattern(), "N");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_queried_schema() {
        let root = tempfile::tempdir().unwrap();
        let store = store_with_iquery(
            root.path(),
            "echo \"{i} schema\"; echo \"{0} 'A<v:int64,s:string> [i=0:*,250,0]'\"",
        );
        let arrays = ArrayConfig {
            load_name: Some("A".into()),
            ..Default::default()
        };
        let mut registry = TaskRegistry::new();
        let schema = resolve_schema(&store, &mut registry, &arrays).await.unwrap();
        assert_eq!(schema.single_dimension().unwrap().chunk_interval, Some(250));
        assert_eq!(schema.type_pattern(), "NS");
    }

    #[tokio::test]
    async fn test_unmatched_definition_is_corrupt_schema() {
        let root = tempfile::tempdir().unwrap();
        let store = store_with_iquery(root.path(), "echo 'garbage'");
        let arrays = ArrayConfig {
            load_name: Some("A".into()),
            ..Default::default()
        };
        let mut registry = TaskRegistry::new();
        let err = resolve_schema(&store, &mut registry, &arrays)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::CorruptSchema(ref text) if text == "garbage"));
    }

    #[tokio::test]
    async fn test_no_schema_configured_is_configuration_error() {
        let store = unreachable_store(Path::new("/nonexistent"));
        let mut registry = TaskRegistry::new();
        let err = resolve_schema(&store, &mut registry, &ArrayConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
        assert!(registry.is_empty());
    }
}
