//! Splitter stage
//!
//! One `osplitcsv` process reads the input once and writes one CSV fragment per
//! instance. With file fragments the coordinator waits for it; with FIFOs it runs
//! alongside the converters and is joined after the load.

use crate::context::RunContext;
use crate::convert::ConversionFormat;
use crate::error::{LoadError, Result};
use crate::exec::{CommandSpec, ExecutionTarget, Redirects, TaskId, TaskRegistry};
use crate::input::OpenInput;
use crate::store::StoreClient;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Splitting tool shipped with the installation.
pub const SPLITTER_TOOL: &str = "osplitcsv";

/// Parameters of the split
#[derive(Debug, Clone)]
pub struct Splitter {
    program: PathBuf,
    instances: usize,
    chunk_size: u64,
    skip: u64,
    output_base: String,
    delimiter: Option<String>,
    type_pattern: Option<String>,
    format: ConversionFormat,
}

impl Splitter {
    pub fn new(
        store: &StoreClient,
        context: &RunContext,
        skip: u64,
        format: ConversionFormat,
        instances: usize,
    ) -> Self {
        Self {
            program: store.tool(SPLITTER_TOOL),
            instances,
            chunk_size: context.chunk_size,
            skip,
            output_base: context.output_base().to_string(),
            delimiter: context.delimiter.clone(),
            type_pattern: context.type_pattern.clone(),
            format,
        }
    }

    pub fn command(&self) -> CommandSpec {
        CommandSpec::from_path(&self.program)
            .arg("-n")
            .arg(self.instances.to_string())
            .arg("-c")
            .arg(self.chunk_size.to_string())
            .arg("-s")
            .arg(self.skip.to_string())
            .arg("-o")
            .arg(self.output_base.as_str())
            .opt_arg("-d", self.delimiter.as_deref())
            .opt_arg("-t", self.type_pattern.as_deref())
            .args(self.format.splitter_flag())
    }

    /// Start the splitter on `input`.
    ///
    /// Its output is discarded and its diagnostics pass through. An in-memory input is
    /// written to the splitter's pipe by a feeder that progresses whenever the coordinator
    /// awaits, so a splitter blocked on a FIFO cannot stall the coordinator.
    pub fn start(&self, registry: &mut TaskRegistry, input: &mut OpenInput) -> Result<SplitterHandle> {
        info!("Starting CSV splitting process.");
        let redirects = Redirects::new(input.splitter_stdin()?, Stdio::null(), Stdio::inherit());
        let task = ExecutionTarget::Local.run(registry, "splitter", &self.command(), redirects)?;

        let feeder = match input.take_buffer() {
            Some(buffer) => {
                let stdin = registry.take_stdin(task).ok_or_else(|| {
                    LoadError::stage("Failed to feed input to the splitter.", "no stdin pipe")
                })?;
                Some(tokio::spawn(feed(stdin, buffer)))
            },
            None => None,
        };

        Ok(SplitterHandle { task, feeder })
    }
}

async fn feed(mut stdin: ChildStdin, buffer: Vec<u8>) -> io::Result<usize> {
    stdin.write_all(&buffer).await?;
    stdin.shutdown().await?;
    Ok(buffer.len())
}

/// A running splitter
///
/// Dropping the handle stops an unfinished feeder.
#[derive(Debug)]
pub struct SplitterHandle {
    task: TaskId,
    feeder: Option<JoinHandle<io::Result<usize>>>,
}

impl SplitterHandle {
    /// The splitter process, for watching it while the load drains the fragments.
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Error reported when the splitter exits unsuccessfully.
    pub fn failure(stderr: impl Into<String>) -> LoadError {
        LoadError::stage("Failed to split input CSV file.", stderr)
    }

    /// Finish feeding, then wait for the splitter to exit successfully.
    pub async fn finish(&mut self, registry: &mut TaskRegistry) -> Result<()> {
        let fed = match self.feeder.take() {
            Some(feeder) => Some(match feeder.await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }),
            None => None,
        };

        let output = registry.wait(self.task).await?;
        if !output.success() {
            return Err(Self::failure(output.stderr));
        }
        match fed {
            Some(Ok(bytes)) => debug!("Fed {} bytes to the splitter.", bytes),
            Some(Err(e)) => return Err(LoadError::stage("Failed to feed input to the splitter.", e)),
            None => {},
        }
        Ok(())
    }
}

impl Drop for SplitterHandle {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}
