//! Execution targets
//!
//! Serializes a [`CommandSpec`] for the node it must run on and spawns it into the
//! run's [`TaskRegistry`]. Local commands are executed directly; remote commands are
//! wrapped in `ssh`. A stdin redirection is applied by a `/bin/sh -c 'exec ...'` on the
//! coordinator so the file is opened by the child, never by the coordinator itself.

use super::command::CommandSpec;
use super::ssh::SshOptions;
use super::task::{TaskId, TaskOutput, TaskRegistry};
use crate::error::{LoadError, Result};
use std::fmt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Shell used to apply coordinator-side redirections.
pub const SHELL: &str = "/bin/sh";

/// Standard streams for a spawned task
#[derive(Debug)]
pub struct Redirects {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl Redirects {
    pub fn new(stdin: Stdio, stdout: Stdio, stderr: Stdio) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
        }
    }

    /// No input; stdout and stderr captured.
    pub fn capture() -> Self {
        Self::new(Stdio::null(), Stdio::piped(), Stdio::piped())
    }

    /// No input; stdout discarded; stderr passed through to the loader's stderr.
    pub fn passthrough() -> Self {
        Self::new(Stdio::null(), Stdio::null(), Stdio::inherit())
    }
}

/// Where a command runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionTarget {
    Local,
    Remote { host: String, ssh: SshOptions },
}

impl ExecutionTarget {
    pub fn remote(host: impl Into<String>, ssh: SshOptions) -> Self {
        Self::Remote {
            host: host.into(),
            ssh,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ExecutionTarget::Local)
    }

    /// Argument vector executed on the coordinator for `spec`.
    pub fn render(&self, spec: &CommandSpec) -> Vec<String> {
        let wrapped = match self {
            ExecutionTarget::Local => spec.clone(),
            ExecutionTarget::Remote { host, ssh } => ssh.wrap(host, spec),
        };
        match wrapped.stdin_path() {
            None => wrapped.argv(),
            Some(_) => vec![
                SHELL.to_string(),
                "-c".to_string(),
                format!("exec {}", wrapped.to_shell()),
            ],
        }
    }

    /// Spawn `spec` as a new process group and register it.
    pub fn run(
        &self,
        registry: &mut TaskRegistry,
        label: &str,
        spec: &CommandSpec,
        redirects: Redirects,
    ) -> Result<TaskId> {
        let argv = self.render(spec);
        debug!(target_node = %self, command = %super::command::join_quoted(&argv), "{}", label);

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(redirects.stdin)
            .stdout(redirects.stdout)
            .stderr(redirects.stderr)
            .process_group(0);

        registry.spawn(label, command).map_err(|e| {
            LoadError::stage(
                format!("Failed to start {label} (`{}`).", spec.program()),
                e.to_string(),
            )
        })
    }

    /// Run `spec` to completion with captured output.
    ///
    /// The exit status is returned, not judged; callers decide what failure means.
    pub async fn output(
        &self,
        registry: &mut TaskRegistry,
        label: &str,
        spec: &CommandSpec,
    ) -> Result<TaskOutput> {
        let id = self.run(registry, label, spec, Redirects::capture())?;
        Ok(registry.wait(id).await?)
    }
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTarget::Local => f.write_str("local"),
            ExecutionTarget::Remote { host, .. } => write!(f, "ssh:{host}"),
        }
    }
}
