//! loadcsv CLI Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Parallel bulk loader for a clustered array store.
//!
//! # Overview
//!
//! One input record stream is driven through a pipeline of child processes into
//! per-instance storage fragments, which the coordinator then commits into an array:
//!
//! - **Resolution**: load schema (explicit or queried) and instance topology
//!   ([`resolver`], [`topology`])
//! - **Staging**: per-instance CSV and store-native channels, FIFOs or files ([`staging`])
//! - **Splitting**: one splitter process partitions the input ([`split`])
//! - **Conversion**: one converter per instance, local or over ssh ([`convert`])
//! - **Commit**: load, optionally redimensioned into a target array ([`commit`])
//! - **Lifecycle**: state machine and the all-or-nothing cleanup sweep ([`run`])

pub mod commit;
pub mod config;
pub mod context;
pub mod convert;
pub mod error;
pub mod exec;
pub mod input;
pub mod resolver;
pub mod run;
pub mod split;
pub mod staging;
pub mod store;
pub mod topology;

// Re-export commonly used types
pub use config::LoadConfig;
pub use error::{LoadError, Result};
pub use input::InputSource;
pub use run::{LoadRun, RunOutcome, RunReport};

use clap::Parser;
use commit::Transform;
use config::{DEFAULT_CHUNK_SIZE, DEFAULT_DB_ADDRESS, DEFAULT_DB_PORT, DEFAULT_DB_ROOT};
use std::path::PathBuf;

/// Parallel CSV loader
///
/// Splits the input across every instance of the cluster, converts each fragment to the
/// store's native load format on its instance, and loads the result.
#[derive(Parser, Debug, Clone)]
#[command(name = "loadcsv")]
#[command(author, long_about = None)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Coordinator hostname or IP address
    #[arg(short = 'd', long, env = "LOADCSV_DB_ADDRESS", default_value = DEFAULT_DB_ADDRESS)]
    pub db_address: String,

    /// Coordinator port
    #[arg(short = 'p', long, env = "LOADCSV_DB_PORT", default_value_t = DEFAULT_DB_PORT)]
    pub db_port: u16,

    /// Installation root folder (external tools are found under <root>/bin)
    #[arg(short = 'r', long, env = "LOADCSV_DB_ROOT", default_value = DEFAULT_DB_ROOT)]
    pub db_root: PathBuf,

    /// CSV input file (defaults to standard input)
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Number of leading lines to skip
    #[arg(short = 'n', long, default_value_t = 0)]
    pub skip: u64,

    /// Field type pattern: N number, S string, s nullable string, C char, c nullable char.
    /// Deprecated: overridden by the pattern derived from the load schema
    #[arg(short = 't', long)]
    pub type_pattern: Option<String>,

    /// Field delimiter (guessed from the input when unset)
    #[arg(short = 'D', long)]
    pub delimiter: Option<String>,

    /// Starting coordinate
    #[arg(short = 'f', long, default_value_t = 0, allow_negative_numbers = true)]
    pub starting_coordinate: i64,

    /// Chunk size (overridden by the load schema's chunk interval)
    #[arg(short = 'c', long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Output base name for CSV fragments (defaults to the input name or "stdin.csv")
    #[arg(short = 'o', long)]
    pub output_base: Option<String>,

    /// Create intermediate CSV files instead of FIFOs
    #[arg(short = 'm', long)]
    pub csv_files: bool,

    /// Leave intermediate CSV files after the run
    #[arg(short = 'l', long)]
    pub leave_csv_files: bool,

    /// Create intermediate DLF files instead of FIFOs
    #[arg(short = 'M', long)]
    pub dlf_files: bool,

    /// Leave intermediate DLF files after the run
    #[arg(short = 'L', long)]
    pub leave_dlf_files: bool,

    /// SSH port (system default when unset)
    #[arg(short = 'P', long)]
    pub ssh_port: Option<u16>,

    /// SSH username
    #[arg(short = 'u', long)]
    pub ssh_username: Option<String>,

    /// SSH key/identity file
    #[arg(short = 'k', long)]
    pub ssh_keyfile: Option<PathBuf>,

    /// Bypass SSH strict host key checking
    #[arg(short = 'b', long)]
    pub ssh_bypass_key_check: bool,

    /// SSH cipher (client default when unset)
    #[arg(long)]
    pub ssh_cipher: Option<String>,

    /// Load array name
    #[arg(short = 'a', long)]
    pub load_name: Option<String>,

    /// Load array schema
    #[arg(short = 's', long)]
    pub load_schema: Option<String>,

    /// Shadow array name capturing rejected records
    #[arg(short = 'w', long)]
    pub shadow_name: Option<String>,

    /// Number of load errors allowed per instance
    #[arg(short = 'e', long, default_value_t = 0)]
    pub errors_allowed: u64,

    /// Remove the load and shadow arrays before loading (if they exist)
    #[arg(short = 'x', long)]
    pub remove_load_arrays: bool,

    /// Target array name
    #[arg(short = 'A', long)]
    pub target_name: Option<String>,

    /// Target array schema
    #[arg(short = 'S', long)]
    pub target_schema: Option<String>,

    /// Directory for temporary files
    #[arg(short = 'T', long, env = "LOADCSV_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Remove the target array before loading (if it exists)
    #[arg(short = 'X', long)]
    pub remove_target_array: bool,

    /// Load/redimension composition strategy
    #[arg(short = 'z', long, value_enum, default_value_t = Transform::Rsl, hide = true)]
    pub transform: Transform,

    /// Milliseconds to wait for input to become readable (waits indefinitely when unset)
    #[arg(long)]
    pub input_timeout_ms: Option<u64>,

    /// Print a JSON run report on stdout (log output moves to stderr)
    #[arg(long)]
    pub report_json: bool,

    /// Display verbose messages
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Display the store's version information
    #[arg(short = 'V', long)]
    pub show_version: bool,

    /// Quiet mode
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Print the CLI reference as markdown
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}
