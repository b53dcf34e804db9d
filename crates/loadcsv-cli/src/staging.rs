//! Fragment staging
//!
//! Owns the two per-instance channels of a run: the CSV fragment on the coordinator
//! (splitter to converter) and the store-native fragment on the instance's node
//! (converter to the load). Each hop is independently a FIFO or a plain file.
//!
//! Channels are created on the node that owns them: CSV fragments and local DLF
//! fragments directly, remote DLF fragments through ssh. Removal visits every instance
//! even after a failure, and can be repeated.

use crate::error::{LoadError, Result};
use crate::exec::{CommandSpec, Redirects, TaskId, TaskRegistry};
use crate::topology::{Instance, Topology};
use serde::Serialize;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use tracing::{debug, info, warn};

/// What backs one pipeline hop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Named pipe; producer and consumer run concurrently
    #[default]
    Fifo,
    /// Plain file; producer finishes before the consumer starts
    File,
}

impl ChannelKind {
    /// `File` when the "use files" flag is set.
    pub fn from_flag(use_files: bool) -> Self {
        if use_files {
            ChannelKind::File
        } else {
            ChannelKind::Fifo
        }
    }

    fn noun(self) -> &'static str {
        match self {
            ChannelKind::Fifo => "FIFOs",
            ChannelKind::File => "files",
        }
    }
}

/// Channel kind and retention of one hop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HopConfig {
    pub kind: ChannelKind,
    /// Keep file fragments after the run; meaningless for FIFOs
    pub retain: bool,
}

impl HopConfig {
    pub fn new(kind: ChannelKind, retain: bool) -> Self {
        Self { kind, retain }
    }

    pub fn is_streaming(&self) -> bool {
        self.kind == ChannelKind::Fifo
    }

    /// FIFOs are always removed; files unless retained.
    pub fn removes_after_run(&self) -> bool {
        self.kind == ChannelKind::Fifo || !self.retain
    }
}

/// Create a FIFO at `path`, honoring the process umask.
pub fn make_fifo(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Remove a local fragment; one that does not exist is already removed.
fn remove_local(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Channel lifecycle for one run
#[derive(Debug, Default)]
pub struct FragmentStaging {
    csv: HopConfig,
    dlf: HopConfig,
    csv_created: bool,
    dlf_created: bool,
}

impl FragmentStaging {
    pub fn new(csv: HopConfig, dlf: HopConfig) -> Self {
        Self {
            csv,
            dlf,
            csv_created: false,
            dlf_created: false,
        }
    }

    /// Create both channels for every instance.
    pub async fn create_channels(
        &mut self,
        registry: &mut TaskRegistry,
        topology: &Topology,
    ) -> Result<()> {
        self.create_csv_channels(topology)?;
        self.create_dlf_channels(registry, topology).await
    }

    /// Create CSV fragment FIFOs on the coordinator. File fragments are written by the
    /// splitter itself.
    ///
    /// The hop counts as created from here on, so cleanup covers a partial creation.
    fn create_csv_channels(&mut self, topology: &Topology) -> Result<()> {
        self.csv_created = true;
        if self.csv.kind == ChannelKind::File {
            return Ok(());
        }

        info!("Creating CSV fragment FIFOs.");
        for instance in topology {
            make_fifo(&instance.csv_fragment).map_err(|e| {
                LoadError::resource("create CSV fragment", &instance.csv_fragment, e.to_string())
            })?;
            debug!("\"{}\" created.", instance.csv_fragment.display());
        }
        Ok(())
    }

    /// Create DLF fragment FIFOs on every instance's node. File fragments are written by
    /// the converters.
    ///
    /// Remote creations run concurrently; every one is joined before the first failure
    /// is reported.
    async fn create_dlf_channels(
        &mut self,
        registry: &mut TaskRegistry,
        topology: &Topology,
    ) -> Result<()> {
        self.dlf_created = true;
        if self.dlf.kind == ChannelKind::File {
            return Ok(());
        }

        info!("Creating DLF fragment FIFOs.");
        let mut first_error = None;
        let mut remote = Vec::new();
        for instance in topology {
            if instance.is_local() {
                if let Err(e) = make_fifo(&instance.dlf_fragment) {
                    let err =
                        LoadError::resource("create DLF fragment", &instance.dlf_fragment, e.to_string());
                    first_error.get_or_insert(err);
                }
                continue;
            }
            let spec = CommandSpec::new("mkfifo").arg(path_arg(&instance.dlf_fragment));
            match run_on(registry, instance, "create DLF fragment", &spec) {
                Ok(id) => remote.push((id, instance)),
                Err(err) => {
                    first_error.get_or_insert(err);
                },
            }
        }

        for (id, instance) in remote {
            if let Err(err) = join(registry, id, "create DLF fragment", &instance.dlf_fragment).await {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove both channels, CSV first.
    ///
    /// Every instance of both hops is attempted. The first failure is returned and any
    /// later ones are logged.
    pub async fn remove_channels(&mut self, registry: &mut TaskRegistry, topology: &Topology) -> Result<()> {
        let csv = self.remove_csv_channels(topology);
        let dlf = self.remove_dlf_channels(registry, topology).await;
        match (csv, dlf) {
            (Err(err), Err(later)) => {
                warn!(error = %later, "Cleanup step failed");
                Err(err)
            },
            (csv, dlf) => csv.and(dlf),
        }
    }

    /// Remove the CSV fragments unless never created or retained.
    fn remove_csv_channels(&mut self, topology: &Topology) -> Result<()> {
        if !self.csv_created || !self.csv.removes_after_run() {
            return Ok(());
        }
        self.csv_created = false;

        info!("Removing CSV fragment {}.", self.csv.kind.noun());
        let mut failures = Vec::new();
        for instance in topology {
            match remove_local(&instance.csv_fragment) {
                Ok(()) => debug!("\"{}\" removed.", instance.csv_fragment.display()),
                Err(e) => failures.push(LoadError::resource(
                    "remove CSV fragment",
                    &instance.csv_fragment,
                    e.to_string(),
                )),
            }
        }
        settle(failures)
    }

    /// Remove the DLF fragments on every instance's node unless never created or retained.
    async fn remove_dlf_channels(&mut self, registry: &mut TaskRegistry, topology: &Topology) -> Result<()> {
        if !self.dlf_created || !self.dlf.removes_after_run() {
            return Ok(());
        }
        self.dlf_created = false;

        info!("Removing DLF fragment {}.", self.dlf.kind.noun());
        let mut failures = Vec::new();
        let mut remote = Vec::new();
        for instance in topology {
            if instance.is_local() {
                match remove_local(&instance.dlf_fragment) {
                    Ok(()) => debug!("\"{}\" removed.", instance.dlf_fragment.display()),
                    Err(e) => failures.push(LoadError::resource(
                        "remove DLF fragment",
                        &instance.dlf_fragment,
                        e.to_string(),
                    )),
                }
                continue;
            }
            let spec = CommandSpec::new("rm")
                .arg("-f")
                .arg(path_arg(&instance.dlf_fragment));
            match run_on(registry, instance, "remove DLF fragment", &spec) {
                Ok(id) => remote.push((id, instance)),
                Err(err) => failures.push(err),
            }
        }

        for (id, instance) in remote {
            if let Err(err) = join(registry, id, "remove DLF fragment", &instance.dlf_fragment).await {
                failures.push(err);
            }
        }
        settle(failures)
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn run_on(
    registry: &mut TaskRegistry,
    instance: &Instance,
    action: &str,
    spec: &CommandSpec,
) -> Result<TaskId> {
    instance
        .target
        .run(registry, action, spec, Redirects::capture())
        .map_err(|err| LoadError::resource(action, &instance.dlf_fragment, err.to_string()))
}

async fn join(registry: &mut TaskRegistry, id: TaskId, action: &str, path: &Path) -> Result<()> {
    let output = registry.wait(id).await?;
    if !output.success() {
        return Err(LoadError::resource(action, path, output.stderr));
    }
    Ok(())
}

/// First failure as the result; the rest are logged.
fn settle(failures: Vec<LoadError>) -> Result<()> {
    let mut failures = failures.into_iter();
    let first = failures.next();
    for err in failures {
        warn!(error = %err, "Cleanup step failed");
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::exec::{ExecutionTarget, SshOptions};
    use std::os::unix::fs::FileTypeExt;

    fn local_instance(dir: &Path, id: u64) -> Instance {
        let storage_root = dir.join(format!("inst{id}"));
        std::fs::create_dir_all(&storage_root).unwrap();
        Instance {
            id,
            name: "localhost".into(),
            csv_fragment: dir.join(format!("in.csv_{id:04}")),
            dlf_fragment: storage_root.join("in.csv.r.dlf"),
            storage_root,
            target: ExecutionTarget::Local,
        }
    }

    fn is_fifo(path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|m| m.file_type().is_fifo())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_fifo_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let topology = Topology::new(vec![local_instance(dir.path(), 0), local_instance(dir.path(), 1)]);
        let mut staging = FragmentStaging::new(HopConfig::default(), HopConfig::default());
        let mut registry = TaskRegistry::new();

        staging.create_channels(&mut registry, &topology).await.unwrap();
        for instance in &topology {
            assert!(is_fifo(&instance.csv_fragment));
            assert!(is_fifo(&instance.dlf_fragment));
        }

        staging.remove_channels(&mut registry, &topology).await.unwrap();
        for instance in &topology {
            assert!(!instance.csv_fragment.exists());
            assert!(!instance.dlf_fragment.exists());
        }

        // Idempotent.
        staging.remove_channels(&mut registry, &topology).await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_creation_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let good = local_instance(dir.path(), 0);
        let mut bad = local_instance(dir.path(), 1);
        bad.dlf_fragment = dir.path().join("missing-root/in.csv.r.dlf");
        let topology = Topology::new(vec![good.clone(), bad]);

        let mut staging = FragmentStaging::new(HopConfig::default(), HopConfig::default());
        let mut registry = TaskRegistry::new();
        let err = staging.create_channels(&mut registry, &topology).await.unwrap_err();
        assert!(err.to_string().contains("Failed to create DLF fragment"));
        assert!(staging.dlf_created);
        assert!(is_fifo(&good.dlf_fragment));

        staging.remove_channels(&mut registry, &topology).await.unwrap();
        assert!(!good.dlf_fragment.exists());
        assert!(!good.csv_fragment.exists());
    }

    #[tokio::test]
    async fn test_retained_files_survive() {
        let dir = tempfile::tempdir().unwrap();
        let instance = local_instance(dir.path(), 0);
        std::fs::write(&instance.csv_fragment, "1,2\n").unwrap();
        std::fs::write(&instance.dlf_fragment, "{0}[(1,2)]\n").unwrap();
        let topology = Topology::new(vec![instance.clone()]);

        let mut staging = FragmentStaging::new(
            HopConfig::new(ChannelKind::File, true),
            HopConfig::new(ChannelKind::File, false),
        );
        let mut registry = TaskRegistry::new();
        staging.create_channels(&mut registry, &topology).await.unwrap();
        staging.remove_channels(&mut registry, &topology).await.unwrap();

        assert!(instance.csv_fragment.exists());
        assert!(!instance.dlf_fragment.exists());
    }

    #[tokio::test]
    async fn test_nothing_removed_before_creation() {
        let dir = tempfile::tempdir().unwrap();
        let instance = local_instance(dir.path(), 0);
        std::fs::write(&instance.csv_fragment, "keep").unwrap();
        let topology = Topology::new(vec![instance.clone()]);

        let mut staging = FragmentStaging::new(HopConfig::default(), HopConfig::default());
        let mut registry = TaskRegistry::new();
        staging.remove_channels(&mut registry, &topology).await.unwrap();
        assert!(instance.csv_fragment.exists());
    }

    #[tokio::test]
    async fn test_removal_failure_is_reported_after_visiting_every_instance() {
        let dir = tempfile::tempdir().unwrap();
        let mut busy = local_instance(dir.path(), 0);
        // A non-empty directory cannot be removed as a file.
        busy.csv_fragment = dir.path().join("busy");
        std::fs::create_dir_all(busy.csv_fragment.join("x")).unwrap();
        let other = local_instance(dir.path(), 1);
        let topology = Topology::new(vec![busy, other.clone()]);

        let mut staging = FragmentStaging::new(HopConfig::new(ChannelKind::File, false), HopConfig::default());
        let mut registry = TaskRegistry::new();
        staging.create_channels(&mut registry, &topology).await.unwrap();
        let err = staging.remove_channels(&mut registry, &topology).await.unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Resource);
        assert!(err.to_string().contains("busy"));

        // The failure did not stop removal elsewhere.
        assert!(!other.csv_fragment.exists());
        assert!(!other.dlf_fragment.exists());
    }

    #[test]
    fn test_remote_commands_are_wrapped() {
        let target = ExecutionTarget::remote("node2", SshOptions::default());
        let spec = CommandSpec::new("mkfifo").arg(path_arg(Path::new("/data/1/in.csv.r.dlf")));
        assert_eq!(
            target.render(&spec),
            vec!["ssh", "node2", "mkfifo /data/1/in.csv.r.dlf"]
        );
    }
}
