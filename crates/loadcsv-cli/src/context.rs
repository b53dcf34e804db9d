//! Per-run context
//!
//! Created once at startup and passed explicitly to every stage. Naming of the run's
//! workspace and of both fragment kinds is derived here and nowhere else.

use crate::config::LoadConfig;
use crate::error::{LoadError, Result};
use crate::staging::ChannelKind;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Name used for fragments of data read from standard input.
pub const STDIN_BASE_NAME: &str = "stdin.csv";

const WORKSPACE_PREFIX: &str = "loadcsv.";
const WORKSPACE_SUFFIX: &str = ".d";

/// Identity, workspace and fragment naming of one run
///
/// Immutable after resolution, except `chunk_size` and `type_pattern` which the load
/// schema may override.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    run_id: String,
    workspace: PathBuf,
    output_base: String,
    dlf_fragment_name: String,
    pub chunk_size: u64,
    pub starting_coordinate: i64,
    pub delimiter: Option<String>,
    pub type_pattern: Option<String>,
}

impl RunContext {
    /// Derive a context for `run_id` without touching the filesystem.
    pub fn plan(config: &LoadConfig, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        let workspace = config
            .temp_dir
            .join(format!("{WORKSPACE_PREFIX}{run_id}{WORKSPACE_SUFFIX}"));
        let output_base = output_base(config, &workspace);
        let dlf_fragment_name = format!("{}.{}.dlf", base_name(&output_base), run_id);

        Self {
            run_id,
            workspace,
            output_base,
            dlf_fragment_name,
            chunk_size: config.chunk_size,
            starting_coordinate: config.starting_coordinate,
            delimiter: config.delimiter.clone(),
            type_pattern: config.type_pattern.clone(),
        }
    }

    /// Allocate a fresh run id and create its workspace directory.
    pub fn create(config: &LoadConfig) -> Result<Self> {
        let context = Self::plan(config, Uuid::new_v4().simple().to_string());
        std::fs::create_dir(&context.workspace).map_err(|e| {
            LoadError::resource("create run workspace", &context.workspace, e.to_string())
        })?;
        debug!(workspace = %context.workspace.display(), run_id = %context.run_id, "Created run workspace");
        Ok(context)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn output_base(&self) -> &str {
        &self.output_base
    }

    /// File name of every instance's store-native fragment; also what the load reads.
    pub fn dlf_fragment_name(&self) -> &str {
        &self.dlf_fragment_name
    }

    /// `<output_base>_<id:04>` on the coordinator.
    pub fn csv_fragment(&self, instance_id: u64) -> PathBuf {
        PathBuf::from(format!("{}_{:04}", self.output_base, instance_id))
    }

    /// `<storage_root>/<dlf fragment name>` on the instance's node.
    pub fn dlf_fragment(&self, storage_root: &Path) -> PathBuf {
        storage_root.join(&self.dlf_fragment_name)
    }

    /// Remove the workspace and everything in it. A workspace that is already gone is fine.
    pub fn remove_workspace(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.workspace) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Base path of the CSV fragments.
///
/// An explicit base naming a file is used as is; one naming only a folder (trailing `/`)
/// gets the input's file name appended. Without one, streaming fragments live in the
/// workspace and file fragments in the current folder.
fn output_base(config: &LoadConfig, workspace: &Path) -> String {
    let input_name = config
        .input
        .as_deref()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| STDIN_BASE_NAME.to_string());

    match config.output_base.as_deref() {
        Some(base) if !base.ends_with('/') => base.to_string(),
        Some(folder) => format!("{folder}{input_name}"),
        None if config.csv_channels.kind == ChannelKind::Fifo => {
            workspace.join(&input_name).to_string_lossy().into_owned()
        },
        None => input_name,
    }
}

fn base_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::staging::HopConfig;

    fn config() -> LoadConfig {
        LoadConfig {
            temp_dir: PathBuf::from("/scratch"),
            ..Default::default()
        }
    }

    #[test]
    fn test_streaming_fragments_live_in_workspace() {
        let context = RunContext::plan(&config(), "r1");
        assert_eq!(context.workspace(), Path::new("/scratch/loadcsv.r1.d"));
        assert_eq!(context.output_base(), "/scratch/loadcsv.r1.d/stdin.csv");
        assert_eq!(
            context.csv_fragment(3),
            PathBuf::from("/scratch/loadcsv.r1.d/stdin.csv_0003")
        );
        assert_eq!(context.dlf_fragment_name(), "stdin.csv.r1.dlf");
        assert_eq!(
            context.dlf_fragment(Path::new("/data/000/1")),
            PathBuf::from("/data/000/1/stdin.csv.r1.dlf")
        );
    }

    #[test]
    fn test_file_fragments_default_to_current_folder() {
        let config = LoadConfig {
            input: Some(PathBuf::from("/in/sales.csv")),
            csv_channels: HopConfig::new(ChannelKind::File, false),
            ..config()
        };
        let context = RunContext::plan(&config, "r2");
        assert_eq!(context.output_base(), "sales.csv");
        assert_eq!(context.csv_fragment(12), PathBuf::from("sales.csv_0012"));
    }

    #[test]
    fn test_explicit_output_base() {
        let named = LoadConfig {
            output_base: Some("/out/part".to_string()),
            ..config()
        };
        assert_eq!(RunContext::plan(&named, "r").output_base(), "/out/part");

        let folder = LoadConfig {
            input: Some(PathBuf::from("/in/sales.csv")),
            output_base: Some("/out/".to_string()),
            ..config()
        };
        let context = RunContext::plan(&folder, "r");
        assert_eq!(context.output_base(), "/out/sales.csv");
        assert_eq!(context.dlf_fragment_name(), "sales.csv.r.dlf");
    }

    #[test]
    fn test_create_and_remove_workspace() {
        let temp = tempfile::tempdir().unwrap();
        let config = LoadConfig {
            temp_dir: temp.path().to_path_buf(),
            ..Default::default()
        };

        let a = RunContext::create(&config).unwrap();
        let b = RunContext::create(&config).unwrap();
        assert_ne!(a.run_id(), b.run_id());
        assert!(a.workspace().is_dir());

        a.remove_workspace().unwrap();
        assert!(!a.workspace().exists());
        a.remove_workspace().unwrap();
        b.remove_workspace().unwrap();
    }

    #[test]
    fn test_missing_temp_dir_is_resource_error() {
        let config = LoadConfig {
            temp_dir: PathBuf::from("/nonexistent/loadcsv-test"),
            ..Default::default()
        };
        let err = RunContext::create(&config).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Resource);
    }
}
