//! Load commit stage
//!
//! The four composition strategies are one query shape parameterized by a
//! [`Strategy`] (overwrite or append into the target) and a [`BaseOperator`] (read
//! through the named load array or straight from the input):
//!
//! | Transform | Query |
//! |-----------|-------|
//! | `RSL` | `store(redimension(load(...), T), T)` |
//! | `RSI` | `store(redimension(input(...), T), T)` |
//! | `IRL` | `insert(redimension(load(...), T), T)` |
//! | `IRI` | `insert(redimension(input(...), T), T)` |
//!
//! Without a target the commit is a plain one-dimensional `load(...)` into the load array.

use crate::config::ArrayConfig;
use crate::error::{LoadError, Result};
use crate::exec::{TaskId, TaskRegistry};
use crate::store::StoreClient;
use clap::ValueEnum;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// How the redimensioned records reach the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Overwrite the target
    Store,
    /// Append to the existing target
    Insert,
}

impl Strategy {
    pub fn operator(self) -> &'static str {
        match self {
            Strategy::Store => "store",
            Strategy::Insert => "insert",
        }
    }
}

/// Operator reading the store-native fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseOperator {
    /// Materialize into the named load array
    Load,
    /// Read without materializing
    Input,
}

impl BaseOperator {
    pub fn operator(self) -> &'static str {
        match self {
            BaseOperator::Load => "load",
            BaseOperator::Input => "input",
        }
    }
}

/// Load/redimension composition selected on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize)]
pub enum Transform {
    /// store of redimension of load
    #[value(name = "RSL")]
    #[serde(rename = "RSL")]
    Rsl,
    /// store of redimension of input
    #[value(name = "RSI")]
    #[serde(rename = "RSI")]
    Rsi,
    /// insert of redimension of load
    #[value(name = "IRL")]
    #[serde(rename = "IRL")]
    Irl,
    /// insert of redimension of input
    #[value(name = "IRI")]
    #[serde(rename = "IRI")]
    Iri,
}

impl Transform {
    pub fn strategy(self) -> Strategy {
        match self {
            Transform::Rsl | Transform::Rsi => Strategy::Store,
            Transform::Irl | Transform::Iri => Strategy::Insert,
        }
    }

    pub fn base_operator(self) -> BaseOperator {
        match self {
            Transform::Rsl | Transform::Irl => BaseOperator::Load,
            Transform::Rsi | Transform::Iri => BaseOperator::Input,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transform::Rsl => "RSL",
            Transform::Rsi => "RSI",
            Transform::Irl => "IRL",
            Transform::Iri => "IRI",
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Transform::Rsl => "redimension_store of load",
            Transform::Rsi => "redimension_store of input",
            Transform::Irl => "insert of redimension of load",
            Transform::Iri => "insert of redimension of input",
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transform {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RSL" => Ok(Transform::Rsl),
            "RSI" => Ok(Transform::Rsi),
            "IRL" => Ok(Transform::Irl),
            "IRI" => Ok(Transform::Iri),
            _ => Err(LoadError::config(format!(
                "Invalid transform '{s}': expected RSL, RSI, IRL or IRI."
            ))),
        }
    }
}

/// `op(<source>, '<dlf>', -1, 'text', <errors>[, <shadow>])`
///
/// `source` is the load array name, or the schema text for an anonymous load.
pub fn base_call(
    operator: BaseOperator,
    source: &str,
    dlf_name: &str,
    errors_allowed: u64,
    shadow: Option<&str>,
) -> String {
    let mut call = format!(
        "{}({source}, '{dlf_name}', -1, 'text', {errors_allowed}",
        operator.operator()
    );
    if let Some(shadow) = shadow {
        call.push_str(", ");
        call.push_str(shadow);
    }
    call.push(')');
    call
}

/// `<strategy>(redimension(<base>, T), T)`
pub fn redimension_query(transform: Transform, base: &str, target: &str) -> String {
    format!(
        "{}(redimension({base}, {target}), {target})",
        transform.strategy().operator()
    )
}

/// The single query committing the run.
///
/// Fails when there is no array to commit into.
pub fn commit_query(arrays: &ArrayConfig, dlf_name: &str) -> Result<String> {
    let shadow = arrays.shadow_name.as_deref();
    match &arrays.target_name {
        Some(target) => {
            let source = arrays
                .load_name
                .as_deref()
                .or(arrays.load_schema.as_deref())
                .ok_or_else(|| {
                    LoadError::config(
                        "When specifying a target array name, a load array name and/or load array schema must also be provided.",
                    )
                })?;
            let base = base_call(
                arrays.transform.base_operator(),
                source,
                dlf_name,
                arrays.errors_allowed,
                shadow,
            );
            Ok(redimension_query(arrays.transform, &base, target))
        },
        None => {
            let load = arrays.load_name.as_deref().ok_or_else(|| {
                LoadError::config(
                    "A load array schema without a load array name requires a target array name.",
                )
            })?;
            Ok(base_call(BaseOperator::Load, load, dlf_name, arrays.errors_allowed, shadow))
        },
    }
}

/// Prepares arrays and issues the commit for one run
#[derive(Debug)]
pub struct LoadCommit<'a> {
    store: &'a StoreClient,
    arrays: &'a ArrayConfig,
    dlf_name: &'a str,
}

impl<'a> LoadCommit<'a> {
    pub fn new(store: &'a StoreClient, arrays: &'a ArrayConfig, dlf_name: &'a str) -> Self {
        Self {
            store,
            arrays,
            dlf_name,
        }
    }

    /// Create the load array (and target, if a target schema is given), optionally
    /// removing old ones first. Removal is best-effort; creation is strict.
    pub async fn prepare_arrays(&self, registry: &mut TaskRegistry) -> Result<()> {
        let arrays = self.arrays;
        if let (Some(load), Some(schema)) = (&arrays.load_name, &arrays.load_schema) {
            if arrays.remove_load_arrays {
                self.store.remove_array(registry, load, true).await?;
                if let Some(shadow) = &arrays.shadow_name {
                    self.store.remove_array(registry, shadow, true).await?;
                }
            }
            self.store.create_array(registry, load, schema).await?;
        }

        if let (Some(target), Some(schema)) = (&arrays.target_name, &arrays.target_schema) {
            if arrays.remove_target_array {
                self.store.remove_array(registry, target, true).await?;
            }
            self.store.create_array(registry, target, schema).await?;
        }
        Ok(())
    }

    /// Prepare arrays and run the commit query. Returns the query issued.
    ///
    /// `watched` are the streaming stages still feeding the load. The first of them to
    /// fail ends the commit with the error `stage_failure` builds for it.
    pub async fn commit<F>(
        &self,
        registry: &mut TaskRegistry,
        watched: &[TaskId],
        stage_failure: F,
    ) -> Result<String>
    where
        F: Fn(TaskId) -> LoadError,
    {
        let query = commit_query(self.arrays, self.dlf_name)?;

        self.prepare_arrays(registry).await?;

        match (&self.arrays.target_name, &self.arrays.load_name) {
            (Some(target), _) => info!(
                "Loading data into \"{}\" array using {} (may take a while for large input files).",
                target,
                self.arrays.transform.describe()
            ),
            (None, Some(load)) => info!(
                "Loading data into \"{}\" array (may take a while for large input files). 1-D load only since no target array name was provided.",
                load
            ),
            (None, None) => {},
        }
        debug!(query = %query, "Commit query");

        match self
            .store
            .execute_watching(registry, &query, "Load failed.", watched)
            .await?
        {
            Some(task) => Err(stage_failure(task)),
            None => Ok(query),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn arrays(transform: Transform) -> ArrayConfig {
        ArrayConfig {
            load_name: Some("A".into()),
            target_name: Some("T".into()),
            transform,
            ..Default::default()
        }
    }

    #[test]
    fn test_four_strategies() {
        let dlf = "in.csv.r.dlf";
        let query = |t| commit_query(&arrays(t), dlf).unwrap();
        assert_eq!(
            query(Transform::Rsl),
            "store(redimension(load(A, 'in.csv.r.dlf', -1, 'text', 0), T), T)"
        );
        assert_eq!(
            query(Transform::Rsi),
            "store(redimension(input(A, 'in.csv.r.dlf', -1, 'text', 0), T), T)"
        );
        assert_eq!(
            query(Transform::Irl),
            "insert(redimension(load(A, 'in.csv.r.dlf', -1, 'text', 0), T), T)"
        );
        assert_eq!(
            query(Transform::Iri),
            "insert(redimension(input(A, 'in.csv.r.dlf', -1, 'text', 0), T), T)"
        );
    }

    #[test]
    fn test_one_dimensional_load_with_shadow() {
        let arrays = ArrayConfig {
            load_name: Some("A".into()),
            shadow_name: Some("A_shadow".into()),
            errors_allowed: 100,
            ..Default::default()
        };
        assert_eq!(
            commit_query(&arrays, "x.dlf").unwrap(),
            "load(A, 'x.dlf', -1, 'text', 100, A_shadow)"
        );
    }

    #[test]
    fn test_anonymous_load_schema() {
        let arrays = ArrayConfig {
            load_schema: Some("<v:int64>[i=0:*,10,0]".into()),
            target_name: Some("T".into()),
            transform: Transform::Rsi,
            ..Default::default()
        };
        assert_eq!(
            commit_query(&arrays, "x.dlf").unwrap(),
            "store(redimension(input(<v:int64>[i=0:*,10,0], 'x.dlf', -1, 'text', 0), T), T)"
        );
    }

    #[test]
    fn test_nothing_to_commit_into_is_configuration_error() {
        let err = commit_query(&ArrayConfig::default(), "x.dlf").unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);

        let schema_only = ArrayConfig {
            load_schema: Some("<v:int64>[i=0:*,10,0]".into()),
            ..Default::default()
        };
        assert!(commit_query(&schema_only, "x.dlf").is_err());
    }

    #[test]
    fn test_target_without_load_is_configuration_error() {
        let arrays = ArrayConfig {
            target_name: Some("T".into()),
            ..Default::default()
        };
        assert!(commit_query(&arrays, "x.dlf").is_err());
    }

    #[tokio::test]
    async fn test_failed_stage_ends_the_commit() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = bin.join("iquery");
        std::fs::write(&tool, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = StoreClient::new(&StoreConfig {
            root: root.path().to_path_buf(),
            ..Default::default()
        });
        let arrays = ArrayConfig {
            load_name: Some("A".into()),
            ..Default::default()
        };
        let mut registry = TaskRegistry::new();
        let mut converter = tokio::process::Command::new("/bin/sh");
        converter.args(["-c", "exit 1"]).process_group(0);
        let converter = registry.spawn("converter", converter).unwrap();

        let err = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            LoadCommit::new(&store, &arrays, "x.dlf").commit(&mut registry, &[converter], |task| {
                LoadError::stage(format!("{} failed.", task == converter), "")
            }),
        )
        .await
        .expect("the commit must not wait for the stuck query")
        .unwrap_err();
        assert_eq!(err.to_string(), "true failed.");

        // The abandoned query is left for the termination sweep.
        assert_eq!(registry.terminate_all().await, 1);
    }

    #[test]
    fn test_transform_parsing() {
        assert_eq!("iri".parse::<Transform>().unwrap(), Transform::Iri);
        assert_eq!("RSL".parse::<Transform>().unwrap(), Transform::Rsl);
        assert!("XYZ".parse::<Transform>().is_err());
        assert_eq!(Transform::Irl.to_string(), "IRL");
    }

    #[tokio::test]
    async fn test_commit_prepares_arrays_in_order() {
        let root = tempfile::tempdir().unwrap();
        let log = root.path().join("queries.log");
        let bin = root.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = bin.join("iquery");
        std::fs::write(
            &tool,
            format!(
                "#!/bin/sh\nfor last; do :; done\necho \"$last\" >> '{}'\ncase \"$last\" in remove*) exit 1;; esac\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let store = StoreClient::new(&StoreConfig {
            root: root.path().to_path_buf(),
            ..Default::default()
        });
        let arrays = ArrayConfig {
            load_name: Some("A".into()),
            load_schema: Some("<v:int64>[i=0:*,10,0]".into()),
            shadow_name: Some("S".into()),
            target_name: Some("T".into()),
            target_schema: Some("<i:int64>[v=0:*,10,0]".into()),
            remove_load_arrays: true,
            remove_target_array: true,
            transform: Transform::Irl,
            ..Default::default()
        };
        let mut registry = TaskRegistry::new();
        let query = LoadCommit::new(&store, &arrays, "x.dlf")
            .commit(&mut registry, &[], |_| LoadError::stage("unreachable", ""))
            .await
            .unwrap();
        assert_eq!(
            query,
            "insert(redimension(load(A, 'x.dlf', -1, 'text', 0, S), T), T)"
        );

        let issued = std::fs::read_to_string(Path::new(&log)).unwrap();
        assert_eq!(
            issued.lines().collect::<Vec<_>>(),
            vec![
                "remove(A)",
                "remove(S)",
                "CREATE ARRAY A <v:int64>[i=0:*,10,0]",
                "remove(T)",
                "CREATE ARRAY T <i:int64>[v=0:*,10,0]",
                "insert(redimension(load(A, 'x.dlf', -1, 'text', 0, S), T), T)",
            ]
        );
    }
}
