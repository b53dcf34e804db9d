//! Run lifecycle and cleanup
//!
//! A [`LoadRun`] owns every resource of one load: the task registry, the workspace,
//! the opened input and the staged channels. It drives the state machine
//!
//! ```text
//! Init -> SchemaResolved -> TopologyResolved -> ChannelsStaged
//!      -> Splitting -> Converting -> Committing -> Done
//! ```
//!
//! with `Failed` reachable from every non-terminal state, including on SIGINT or SIGTERM.
//! Whatever the outcome, the cleanup sweep runs exactly once before [`LoadRun::execute`]
//! returns: close the input, terminate running tasks, remove CSV fragments, remove DLF
//! fragments, remove the workspace. Cleanup problems are logged, never returned.

use crate::commit::LoadCommit;
use crate::config::LoadConfig;
use crate::context::RunContext;
use crate::convert::{self, ConversionTask, Converter};
use crate::error::{ErrorCategory, LoadError, Result};
use crate::exec::{TaskId, TaskRegistry};
use crate::input::{InputSource, OpenInput};
use crate::resolver;
use crate::split::{Splitter, SplitterHandle};
use crate::staging::FragmentStaging;
use crate::store::StoreClient;
use crate::topology::{HostAddresses, Topology};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Position in the run state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    SchemaResolved,
    TopologyResolved,
    ChannelsStaged,
    Splitting,
    Converting,
    Committing,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Loaded,
    NoInput,
    Failed,
}

impl RunOutcome {
    /// `0` loaded, `1` no input, `2` failed.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Loaded => 0,
            RunOutcome::NoInput => 1,
            RunOutcome::Failed => 2,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Option<String>,
    pub state: RunState,
    /// State the run was in when it failed
    pub failed_in: Option<RunState>,
    pub outcome: RunOutcome,
    pub exit_code: i32,
    pub instances: usize,
    pub chunk_size: Option<u64>,
    pub type_pattern: Option<String>,
    pub commit_query: Option<String>,
    /// Output of the version report, when requested
    pub version: Option<String>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// One load, from configuration to cleanup
#[derive(Debug)]
pub struct LoadRun {
    config: LoadConfig,
    input: Option<InputSource>,
    state: RunState,
    registry: TaskRegistry,
    store: StoreClient,
    hosts: Option<HostAddresses>,
    context: Option<RunContext>,
    opened: Option<OpenInput>,
    topology: Option<Topology>,
    staging: FragmentStaging,
    splitter: Option<SplitterHandle>,
    converters: Vec<ConversionTask>,
    version: Option<String>,
    commit_query: Option<String>,
}

impl LoadRun {
    /// A run reading the configured input file, or standard input.
    pub fn new(config: LoadConfig) -> Self {
        let input = InputSource::from_path(config.input.clone());
        Self::with_input(config, input)
    }

    /// A run reading `input`, e.g. an in-memory buffer.
    pub fn with_input(config: LoadConfig, input: InputSource) -> Self {
        let store = StoreClient::new(&config.store);
        let staging = FragmentStaging::new(config.csv_channels, config.dlf_channels);
        Self {
            config,
            input: Some(input),
            state: RunState::Init,
            registry: TaskRegistry::new(),
            store,
            hosts: None,
            context: None,
            opened: None,
            topology: None,
            staging,
            splitter: None,
            converters: Vec::new(),
            version: None,
            commit_query: None,
        }
    }

    /// Classify instances against `hosts` instead of this host's detected addresses.
    pub fn with_host_addresses(mut self, hosts: HostAddresses) -> Self {
        self.hosts = Some(hosts);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Drive the run to a terminal state, clean up, and report.
    ///
    /// SIGINT or SIGTERM abandon the run; cleanup still runs.
    pub async fn execute(self) -> RunReport {
        self.execute_until(shutdown_signal()).await
    }

    /// Like [`LoadRun::execute`], abandoning the run once `shutdown` yields the name of
    /// what stopped it.
    pub async fn execute_until<S>(mut self, shutdown: S) -> RunReport
    where
        S: Future<Output = String>,
    {
        let started_at = Utc::now();
        let started = Instant::now();

        let driven = tokio::select! {
            result = self.drive() => result,
            cause = shutdown => Err(LoadError::Interrupted(cause)),
        };
        let (outcome, failure) = match driven {
            Ok(outcome) => (outcome, None),
            Err(err) => {
                let failed_in = self.state;
                self.state = RunState::Failed;
                error!(error = %err, category = ?err.category(), state = ?failed_in, "Load run failed");
                (RunOutcome::Failed, Some((failed_in, err)))
            },
        };

        self.cleanup().await;

        let elapsed = started.elapsed();
        debug!("Total Elapsed Time: {:.3} seconds.", elapsed.as_secs_f64());
        match outcome {
            RunOutcome::Loaded => info!("Success: Data Loaded."),
            RunOutcome::NoInput => info!("No Data Loaded."),
            RunOutcome::Failed => info!("Failure: Error Encountered."),
        }

        RunReport {
            run_id: self.context.as_ref().map(|c| c.run_id().to_string()),
            state: self.state,
            failed_in: failure.as_ref().map(|(state, _)| *state),
            outcome,
            exit_code: outcome.exit_code(),
            instances: self.topology.as_ref().map_or(0, Topology::len),
            chunk_size: self.context.as_ref().map(|c| c.chunk_size),
            type_pattern: self.context.as_ref().and_then(|c| c.type_pattern.clone()),
            commit_query: self.commit_query.take(),
            version: self.version.take(),
            error: failure.as_ref().map(|(_, err)| err.to_string()),
            error_category: failure.as_ref().map(|(_, err)| err.category()),
            started_at,
            elapsed_seconds: elapsed.as_secs_f64(),
        }
    }

    async fn drive(&mut self) -> Result<RunOutcome> {
        if self.config.show_version {
            self.version = Some(self.store.version(&mut self.registry).await?);
        }

        let schema =
            resolver::resolve_schema(&self.store, &mut self.registry, &self.config.arrays).await?;
        let context = self.context.insert(RunContext::create(&self.config)?);
        resolver::apply_schema(context, &schema)?;
        advance(&mut self.state, RunState::SchemaResolved);

        let input = self.input.take().unwrap_or(InputSource::Stdin);
        let opened = self.opened.insert(input.open()?);
        if !opened.has_data(self.config.input_timeout)? {
            warn!("No input data was found.");
            return Ok(RunOutcome::NoInput);
        }

        let hosts = self.hosts.get_or_insert_with(HostAddresses::detect);
        let topology = self.topology.insert(
            resolver::resolve_topology(&self.store, &mut self.registry, context, hosts, &self.config.ssh)
                .await?,
        );
        advance(&mut self.state, RunState::TopologyResolved);

        self.staging
            .create_channels(&mut self.registry, topology)
            .await?;
        advance(&mut self.state, RunState::ChannelsStaged);

        let splitter = Splitter::new(
            &self.store,
            context,
            self.config.skip,
            self.config.format,
            topology.len(),
        );
        let handle = self
            .splitter
            .insert(splitter.start(&mut self.registry, opened)?);
        advance(&mut self.state, RunState::Splitting);
        if !self.config.csv_channels.is_streaming() {
            handle.finish(&mut self.registry).await?;
            self.splitter = None;
        }

        let converter = Converter::new(&self.store, context, self.config.format, topology.len());
        self.converters = converter.launch(&mut self.registry, topology)?;
        advance(&mut self.state, RunState::Converting);
        if !self.config.dlf_channels.is_streaming() {
            convert::wait_all(&mut self.registry, &self.converters).await?;
            self.converters.clear();
        }

        // Stages still running feed the load through FIFOs; watch them while it runs.
        let mut watched: Vec<TaskId> = self.converters.iter().map(|c| c.task).collect();
        watched.extend(self.splitter.as_ref().map(SplitterHandle::task));

        advance(&mut self.state, RunState::Committing);
        let converters = &self.converters;
        let commit = LoadCommit::new(&self.store, &self.config.arrays, context.dlf_fragment_name());
        let query = commit
            .commit(&mut self.registry, &watched, |task| stage_failure(converters, task))
            .await?;
        self.commit_query = Some(query);

        // Streaming stages are only known to have succeeded once the load drained them.
        if let Some(mut handle) = self.splitter.take() {
            handle.finish(&mut self.registry).await?;
        }
        convert::wait_all(&mut self.registry, &self.converters).await?;
        self.converters.clear();

        advance(&mut self.state, RunState::Done);
        Ok(RunOutcome::Loaded)
    }

    async fn cleanup(&mut self) {
        debug!("Performing cleanup tasks.");

        if let Some(mut input) = self.opened.take() {
            input.close();
        }
        self.splitter = None;
        self.converters.clear();

        let running = self.registry.running();
        if running > 0 {
            debug!("{} child process(es) still running.", running);
        }
        let terminated = self.registry.terminate_all().await;
        if terminated > 0 {
            debug!("Terminated {} child process(es).", terminated);
        }

        // Remote removals are joined before this returns.
        if let Some(topology) = &self.topology {
            if let Err(err) = self.staging.remove_channels(&mut self.registry, topology).await {
                warn!(error = %err, "Cleanup step failed");
            }
        }

        if let Some(context) = &self.context {
            if let Err(err) = context.remove_workspace() {
                warn!(
                    error = %LoadError::resource("remove run workspace", context.workspace(), err.to_string()),
                    "Cleanup step failed"
                );
            }
        }
    }
}

/// The error of the streaming stage behind `task`.
fn stage_failure(converters: &[ConversionTask], task: TaskId) -> LoadError {
    match converters.iter().find(|c| c.task == task) {
        Some(converter) => converter.failure(""),
        None => SplitterHandle::failure(""),
    }
}

/// Completes with the name of the first SIGINT or SIGTERM received.
///
/// A handler that cannot be installed never fires.
pub async fn shutdown_signal() -> String {
    let interrupt = async {
        match signal(SignalKind::interrupt()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGINT handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    let cause = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    warn!("Received {}, abandoning the load", cause);
    cause.to_string()
}

fn advance(state: &mut RunState, next: RunState) {
    debug_assert!(!state.is_terminal(), "no transition leaves {state:?}");
    debug!(from = ?*state, to = ?next, "Run state");
    *state = next;
}
