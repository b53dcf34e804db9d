//! Run-wide task registry
//!
//! Every child process the loader starts is registered here the moment it is spawned,
//! before anyone can block on it. The registry is owned by the run coordinator and
//! drained exactly once by the termination sweep.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

/// How long a terminated process group gets before it is killed outright.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Handle to a registered task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

/// One spawned child process and what it serves
#[derive(Debug)]
struct Task {
    label: String,
    pid: Option<u32>,
    child: Child,
}

/// Exit status plus whatever was captured from the task's pipes
#[derive(Debug)]
pub struct TaskOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl TaskOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// How a watched wait ended
#[derive(Debug)]
pub enum Watched {
    /// The awaited task exited
    Exited(TaskOutput),
    /// A watched task failed first
    Failed { task: TaskId, status: ExitStatus },
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` and record it under `label`.
    pub fn spawn(&mut self, label: impl Into<String>, mut command: Command) -> io::Result<TaskId> {
        let label = label.into();
        let child = command.spawn()?;
        let pid = child.id();
        debug!(task = %label, pid = ?pid, "Started child process");
        self.tasks.push(Task { label, pid, child });
        Ok(TaskId(self.tasks.len() - 1))
    }

    fn task_mut(&mut self, id: TaskId) -> io::Result<&mut Task> {
        self.tasks
            .get_mut(id.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "task is no longer registered"))
    }

    /// Take the write end of a task spawned with a piped standard input.
    pub fn take_stdin(&mut self, id: TaskId) -> Option<ChildStdin> {
        self.task_mut(id).ok().and_then(|t| t.child.stdin.take())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of registered tasks that have not exited yet.
    pub fn running(&mut self) -> usize {
        let mut running = 0;
        for task in &mut self.tasks {
            if matches!(task.child.try_wait(), Ok(None)) {
                running += 1;
            }
        }
        running
    }

    /// The first of `watched` that has exited unsuccessfully, if any. Never blocks.
    pub fn first_failure(&mut self, watched: &[TaskId]) -> io::Result<Option<(TaskId, ExitStatus)>> {
        for &id in watched {
            let task = self.task_mut(id)?;
            if let Some(status) = task.child.try_wait()? {
                if !status.success() {
                    debug!(task = %task.label, status = %status, "Watched child process failed");
                    return Ok(Some((id, status)));
                }
            }
        }
        Ok(None)
    }

    /// Wait for `id` like [`TaskRegistry::wait`], checking `watched` every `poll`.
    ///
    /// Returns early when a watched task exits unsuccessfully; `id` is left running for
    /// the termination sweep.
    pub async fn wait_watching(
        &mut self,
        id: TaskId,
        watched: &[TaskId],
        poll: Duration,
    ) -> io::Result<Watched> {
        let task = self.task_mut(id)?;
        let stdout = task.child.stdout.take();
        let stderr = task.child.stderr.take();
        let mut pipes = Box::pin(async move { tokio::try_join!(read_pipe(stdout), read_pipe(stderr)) });
        let mut captured = None;

        loop {
            let task = self.task_mut(id)?;
            tokio::select! {
                read = &mut pipes, if captured.is_none() => {
                    captured = Some(read?);
                    continue;
                },
                status = task.child.wait(), if captured.is_some() => {
                    let status = status?;
                    debug!(task = %task.label, status = %status, "Child process exited");
                    let (stdout, stderr) = captured.take().unwrap_or_default();
                    return Ok(Watched::Exited(TaskOutput {
                        status,
                        stdout,
                        stderr,
                    }));
                },
                _ = tokio::time::sleep(poll) => {},
            }

            if let Some((failed, status)) = self.first_failure(watched)? {
                return Ok(Watched::Failed { task: failed, status });
            }
        }
    }

    /// Wait for a task to exit, draining its captured pipes concurrently.
    pub async fn wait(&mut self, id: TaskId) -> io::Result<TaskOutput> {
        let task = self.task_mut(id)?;
        let stdout = task.child.stdout.take();
        let stderr = task.child.stderr.take();
        let (status, stdout, stderr) =
            tokio::try_join!(task.child.wait(), read_pipe(stdout), read_pipe(stderr))?;
        debug!(task = %task.label, status = %status, "Child process exited");
        Ok(TaskOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Terminate every still-running task's process group and join it.
    ///
    /// Empties the registry; calling it again is a no-op. Returns how many tasks were
    /// still running. Never fails: problems are logged.
    pub async fn terminate_all(&mut self) -> usize {
        let mut terminated = 0;
        for mut task in std::mem::take(&mut self.tasks) {
            match terminate(&mut task).await {
                Ok(true) => terminated += 1,
                Ok(false) => {},
                Err(e) => warn!(task = %task.label, error = %e, "Failed to terminate child process"),
            }
        }
        terminated
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn terminate(task: &mut Task) -> io::Result<bool> {
    if task.child.try_wait()?.is_some() {
        return Ok(false);
    }
    debug!(task = %task.label, pid = ?task.pid, "Terminating child process group");
    match task.pid {
        Some(pid) => signal_group(pid, libc::SIGTERM)?,
        None => task.child.start_kill()?,
    }
    if tokio::time::timeout(TERMINATE_GRACE, task.child.wait())
        .await
        .is_err()
    {
        warn!(task = %task.label, "Child process ignored SIGTERM, killing");
        match task.pid {
            Some(pid) => signal_group(pid, libc::SIGKILL)?,
            None => task.child.start_kill()?,
        }
        task.child.wait().await?;
    }
    Ok(true)
}

/// Send `signal` to the process group led by `pid`.
///
/// Tasks are spawned as group leaders, so the group id equals the pid. A group that is
/// already gone is not an error.
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg only reads its integer arguments.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}
