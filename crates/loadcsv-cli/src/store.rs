//! Client for the store's query interface
//!
//! Every interaction with the coordinator goes through the `iquery` tool found under the
//! installation's `bin` folder. Commands run on the coordinator node, are registered in
//! the run's task registry like every other child, and report success by exit status.

use crate::config::StoreConfig;
use crate::error::{LoadError, Result};
use crate::exec::{CommandSpec, ExecutionTarget, Redirects, TaskId, TaskOutput, TaskRegistry, Watched};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Query tool used for every store command.
pub const QUERY_TOOL: &str = "iquery";

/// Server binary that reports version information.
pub const VERSION_TOOL: &str = "scidb";

/// How often a running query checks the tasks feeding it.
pub const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Client for one coordinator
#[derive(Debug, Clone)]
pub struct StoreClient {
    bin_dir: PathBuf,
    address: String,
    port: u16,
}

impl StoreClient {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            bin_dir: config.bin_dir(),
            address: config.address.clone(),
            port: config.port,
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Absolute path of a tool shipped with the installation.
    pub fn tool(&self, name: &str) -> PathBuf {
        self.bin_dir.join(name)
    }

    fn iquery(&self) -> CommandSpec {
        CommandSpec::from_path(&self.tool(QUERY_TOOL))
            .arg("-c")
            .arg(self.address.as_str())
            .arg("-p")
            .arg(self.port.to_string())
    }

    pub fn version_command(&self) -> CommandSpec {
        CommandSpec::from_path(&self.tool(VERSION_TOOL)).arg("--version")
    }

    pub fn list_instances_command(&self) -> CommandSpec {
        self.iquery().args(["-o", "csv", "-aq", "list('instances')"])
    }

    pub fn show_array_command(&self, array: &str) -> CommandSpec {
        self.iquery()
            .args(["-o", "text", "-aq"])
            .arg(format!("show({array})"))
    }

    pub fn create_array_command(&self, array: &str, schema: &str) -> CommandSpec {
        self.iquery()
            .arg("-nq")
            .arg(format!("CREATE ARRAY {array} {schema}"))
    }

    pub fn remove_array_command(&self, array: &str) -> CommandSpec {
        self.iquery().arg("-anq").arg(format!("remove({array})"))
    }

    pub fn query_command(&self, query: &str) -> CommandSpec {
        self.iquery().arg("-anq").arg(query)
    }

    async fn run(
        &self,
        registry: &mut TaskRegistry,
        label: &str,
        spec: &CommandSpec,
    ) -> Result<TaskOutput> {
        debug!(command = %spec, "Running store command");
        ExecutionTarget::Local.output(registry, label, spec).await
    }

    /// Version report of the installation.
    pub async fn version(&self, registry: &mut TaskRegistry) -> Result<String> {
        let output = self
            .run(registry, "version report", &self.version_command())
            .await?;
        if !output.success() {
            return Err(LoadError::resolution(
                "Failed to obtain SciDB version information.",
                output.stderr,
            ));
        }
        Ok(output.stdout)
    }

    /// Raw CSV listing of the cluster's instances.
    pub async fn list_instances(&self, registry: &mut TaskRegistry) -> Result<String> {
        info!("Getting SciDB configuration information.");
        let output = self
            .run(registry, "instance listing", &self.list_instances_command())
            .await?;
        if !output.success() {
            return Err(LoadError::resolution(
                "Failed to obtain SciDB configuration information.",
                output.stderr,
            ));
        }
        Ok(output.stdout)
    }

    /// Definition text of an existing array.
    pub async fn show_array(&self, registry: &mut TaskRegistry, array: &str) -> Result<String> {
        info!("Retrieving load array schema from SciDB.");
        let output = self
            .run(registry, "schema query", &self.show_array_command(array))
            .await?;
        if !output.success() {
            return Err(LoadError::resolution(
                "Failed to obtain schema for load array.",
                output.stderr,
            ));
        }
        Ok(output.stdout)
    }

    /// Create `array`. An array that already exists is a failure.
    pub async fn create_array(
        &self,
        registry: &mut TaskRegistry,
        array: &str,
        schema: &str,
    ) -> Result<()> {
        info!("Creating \"{}\" array.", array);
        let output = self
            .run(registry, "array creation", &self.create_array_command(array, schema))
            .await?;
        if !output.success() {
            return Err(LoadError::stage(
                format!("Failed to create array: \"{array}\"."),
                output.stderr,
            ));
        }
        Ok(())
    }

    /// Remove `array`. With `best_effort`, a failure (typically a missing array) is
    /// logged and ignored.
    pub async fn remove_array(
        &self,
        registry: &mut TaskRegistry,
        array: &str,
        best_effort: bool,
    ) -> Result<()> {
        info!("Removing \"{}\" array.", array);
        let output = self
            .run(registry, "array removal", &self.remove_array_command(array))
            .await?;
        if !output.success() {
            let err = LoadError::stage(format!("Failed to remove array: \"{array}\"."), output.stderr);
            if !best_effort {
                return Err(err);
            }
            debug!(error = %err, "Ignoring array removal failure");
        }
        Ok(())
    }

    /// Execute an AFL query, failing with `failure` plus the tool's stderr.
    ///
    /// The `watched` tasks produce the query's input. If one of them fails first, the
    /// query is abandoned and that task is returned.
    pub async fn execute_watching(
        &self,
        registry: &mut TaskRegistry,
        query: &str,
        failure: &str,
        watched: &[TaskId],
    ) -> Result<Option<TaskId>> {
        let spec = self.query_command(query);
        debug!(command = %spec, "Running store command");
        let id = ExecutionTarget::Local.run(registry, "query", &spec, Redirects::capture())?;
        match registry.wait_watching(id, watched, WATCH_INTERVAL).await? {
            Watched::Exited(output) if output.success() => Ok(None),
            Watched::Exited(output) => Err(LoadError::stage(failure, output.stderr)),
            Watched::Failed { task, .. } => Ok(Some(task)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn client(root: &Path) -> StoreClient {
        StoreClient::new(&StoreConfig {
            address: "coord".to_string(),
            port: 1239,
            root: root.to_path_buf(),
        })
    }

    fn install_tool(root: &Path, name: &str, script: &str) {
        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_command_shapes() {
        let store = client(Path::new("/opt/scidb/14.8"));
        assert_eq!(
            store.list_instances_command().argv(),
            vec![
                "/opt/scidb/14.8/bin/iquery",
                "-c",
                "coord",
                "-p",
                "1239",
                "-o",
                "csv",
                "-aq",
                "list('instances')"
            ]
        );
        assert_eq!(
            store.create_array_command("A", "<v:int64>[i=0:*,10,0]").arguments()[4..].to_vec(),
            vec!["-nq", "CREATE ARRAY A <v:int64>[i=0:*,10,0]"]
        );
        assert_eq!(
            store.version_command().argv(),
            vec!["/opt/scidb/14.8/bin/scidb", "--version"]
        );
    }

    #[tokio::test]
    async fn test_show_array_returns_stdout() {
        let root = tempfile::tempdir().unwrap();
        install_tool(root.path(), QUERY_TOOL, "echo \"{0} A<v:int64> [i=0:*,5,0]\"");

        let mut registry = TaskRegistry::new();
        let text = client(root.path()).show_array(&mut registry, "A").await.unwrap();
        assert!(text.contains("<v:int64> [i=0:*,5,0]"));
    }

    #[tokio::test]
    async fn test_failed_query_carries_stderr() {
        let root = tempfile::tempdir().unwrap();
        install_tool(root.path(), QUERY_TOOL, "echo 'SCIDB_LE_ARRAY_DOESNT_EXIST' >&2; exit 1");

        let store = client(root.path());
        let mut registry = TaskRegistry::new();

        let err = store.show_array(&mut registry, "missing").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to obtain schema for load array.\nSCIDB_LE_ARRAY_DOESNT_EXIST"
        );

        // Best-effort removal swallows the same failure.
        store.remove_array(&mut registry, "missing", true).await.unwrap();
        assert!(store.remove_array(&mut registry, "missing", false).await.is_err());
    }

    #[tokio::test]
    async fn test_query_abandoned_when_feeding_task_fails() {
        let root = tempfile::tempdir().unwrap();
        install_tool(root.path(), QUERY_TOOL, "sleep 30");

        let store = client(root.path());
        let mut registry = TaskRegistry::new();
        let mut feeder = tokio::process::Command::new("/bin/sh");
        feeder.args(["-c", "exit 3"]).process_group(0);
        let feeder = registry.spawn("feeder", feeder).unwrap();

        let failed = store
            .execute_watching(&mut registry, "load(A, 'x.dlf', -1, 'text', 0)", "Load failed.", &[feeder])
            .await
            .unwrap();
        assert_eq!(failed, Some(feeder));
        assert_eq!(registry.terminate_all().await, 1);
    }

    #[tokio::test]
    async fn test_watched_query_failure_carries_stderr() {
        let root = tempfile::tempdir().unwrap();
        install_tool(root.path(), QUERY_TOOL, "echo 'bad chunk' >&2; exit 1");

        let store = client(root.path());
        let mut registry = TaskRegistry::new();
        let err = store
            .execute_watching(&mut registry, "load(A, 'x.dlf', -1, 'text', 0)", "Load failed.", &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Load failed.\nbad chunk");
    }
}
