//! Converter/distributor stage
//!
//! Launches one converter per instance, all at once. Each reads its CSV fragment on the
//! coordinator and writes the store-native fragment on its own node, so a remote
//! converter receives its input through the ssh connection. Instance `k` starts at
//! coordinate `start + k * chunk_size`, which keeps the ranges of all instances disjoint.

use crate::context::RunContext;
use crate::error::{LoadError, Result};
use crate::exec::{CommandSpec, Redirects, TaskId, TaskRegistry};
use crate::store::StoreClient;
use crate::topology::{Instance, Topology};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// Environment variable selecting the legacy converter when set to anything non-empty.
pub const FORMAT_ENV: &str = "SCIDB_USE_CSV";

/// Converter for the tab-separated intermediate format.
pub const TSV_CONVERTER: &str = "tsv2scidb";

/// Legacy converter reading delimiter-separated records.
pub const CSV_CONVERTER: &str = "csv2scidb";

/// Generation of the conversion format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionFormat {
    /// Splitter emits TSV, `tsv2scidb` converts it
    Tsv,
    /// Splitter keeps the input delimiter, `csv2scidb` converts it
    Csv,
}

impl ConversionFormat {
    pub fn from_env() -> Self {
        match std::env::var_os(FORMAT_ENV) {
            Some(value) if !value.is_empty() => ConversionFormat::Csv,
            _ => ConversionFormat::Tsv,
        }
    }

    pub fn converter(self) -> &'static str {
        match self {
            ConversionFormat::Tsv => TSV_CONVERTER,
            ConversionFormat::Csv => CSV_CONVERTER,
        }
    }

    /// Extra splitter flag selecting its output format.
    pub fn splitter_flag(self) -> Option<&'static str> {
        match self {
            ConversionFormat::Tsv => Some("--format=tsv"),
            ConversionFormat::Csv => None,
        }
    }

    /// Delimiter argument for the converter. TSV always uses a literal `\t`.
    pub fn converter_delimiter(self, delimiter: Option<&str>) -> String {
        match self {
            ConversionFormat::Tsv => "\\t".to_string(),
            ConversionFormat::Csv => delimiter.unwrap_or(",").to_string(),
        }
    }
}

/// Starting coordinate of each of `instances` converters.
///
/// Fails if a starting coordinate would leave the coordinate range.
pub fn coordinate_plan(start: i64, chunk_size: u64, instances: usize) -> Result<Vec<i64>> {
    let overflow = || LoadError::config("Starting coordinates exceed the coordinate range.");
    let step = i64::try_from(chunk_size).map_err(|_| overflow())?;
    let mut starts: Vec<i64> = Vec::with_capacity(instances);
    for _ in 0..instances {
        let next = match starts.last() {
            None => start,
            Some(&previous) => previous.checked_add(step).ok_or_else(overflow)?,
        };
        starts.push(next);
    }
    Ok(starts)
}

/// One launched converter
#[derive(Debug, Clone)]
pub struct ConversionTask {
    pub task: TaskId,
    pub instance_id: u64,
    pub csv_fragment: PathBuf,
    pub start: i64,
}

impl ConversionTask {
    /// Error reported when this converter exits unsuccessfully.
    pub fn failure(&self, stderr: impl Into<String>) -> LoadError {
        LoadError::stage(
            format!(
                "Failed to distribute and convert the CSV fragment: \"{}\".",
                self.csv_fragment.display()
            ),
            stderr,
        )
    }
}

/// Parameters shared by every converter of a run
#[derive(Debug, Clone)]
pub struct Converter {
    program: PathBuf,
    chunk_size: u64,
    starting_coordinate: i64,
    instances: usize,
    delimiter: String,
    type_pattern: Option<String>,
}

impl Converter {
    pub fn new(
        store: &StoreClient,
        context: &RunContext,
        format: ConversionFormat,
        instances: usize,
    ) -> Self {
        Self {
            program: store.tool(format.converter()),
            chunk_size: context.chunk_size,
            starting_coordinate: context.starting_coordinate,
            instances,
            delimiter: format.converter_delimiter(context.delimiter.as_deref()),
            type_pattern: context.type_pattern.clone(),
        }
    }

    /// Converter invocation for `instance`, reading its CSV fragment.
    pub fn command(&self, instance: &Instance, start: i64) -> CommandSpec {
        CommandSpec::from_path(&self.program)
            .opt_arg("-p", self.type_pattern.as_deref())
            .arg("-c")
            .arg(self.chunk_size.to_string())
            .arg("-f")
            .arg(start.to_string())
            .arg("-n")
            .arg(self.instances.to_string())
            .arg("-d")
            .arg(self.delimiter.as_str())
            .arg("-o")
            .arg(instance.dlf_fragment.to_string_lossy())
            .stdin_from(&instance.csv_fragment)
    }

    /// Launch every converter without waiting in between.
    pub fn launch(
        &self,
        registry: &mut TaskRegistry,
        topology: &Topology,
    ) -> Result<Vec<ConversionTask>> {
        info!("Starting CSV distribution and conversion processes.");
        info!("Converter is {}", self.program.display());

        let starts = coordinate_plan(self.starting_coordinate, self.chunk_size, topology.len())?;
        let mut launched = Vec::with_capacity(topology.len());
        for (instance, start) in topology.iter().zip(starts) {
            let label = format!("converter for instance {}", instance.id);
            let task = instance.target.run(
                registry,
                &label,
                &self.command(instance, start),
                Redirects::passthrough(),
            )?;
            debug!(instance = instance.id, start, target = %instance.target, "Converter started");
            launched.push(ConversionTask {
                task,
                instance_id: instance.id,
                csv_fragment: instance.csv_fragment.clone(),
                start,
            });
        }
        Ok(launched)
    }
}

/// Wait for every converter in launch order; the first failure names its fragment.
pub async fn wait_all(registry: &mut TaskRegistry, tasks: &[ConversionTask]) -> Result<()> {
    for launched in tasks {
        let output = registry.wait(launched.task).await?;
        if !output.success() {
            return Err(launched.failure(output.stderr));
        }
    }
    Ok(())
}
