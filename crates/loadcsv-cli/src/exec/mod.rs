//! Execution Target: running commands locally or on remote instances
//!
//! - [`command`]: structured command descriptors and the shell quoting rules
//! - [`ssh`]: secure-shell wrapping for remote instances
//! - [`target`]: per-back-end serialization and spawning
//! - [`task`]: the run-wide registry of spawned processes

pub mod command;
pub mod ssh;
pub mod target;
pub mod task;

pub use command::CommandSpec;
pub use ssh::SshOptions;
pub use target::{ExecutionTarget, Redirects};
pub use task::{TaskId, TaskOutput, TaskRegistry, Watched};
