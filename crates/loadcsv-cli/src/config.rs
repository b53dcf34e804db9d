//! Validated run configuration
//!
//! [`LoadConfig::from_cli`] turns parsed flags into an immutable configuration and rejects
//! every invalid combination before any resource is created.

use crate::commit::Transform;
use crate::convert::ConversionFormat;
use crate::error::{LoadError, Result};
use crate::exec::SshOptions;
use crate::staging::{ChannelKind, HopConfig};
use crate::Cli;
use loadcsv_common::Schema;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Coordinator address when none is given.
pub const DEFAULT_DB_ADDRESS: &str = "localhost";

/// Coordinator port when none is given.
pub const DEFAULT_DB_PORT: u16 = 1239;

/// Installation root when none is given.
pub const DEFAULT_DB_ROOT: &str = "/opt/scidb/14.8";

/// Records per partition unit when no schema says otherwise.
pub const DEFAULT_CHUNK_SIZE: u64 = 500_000;

/// Parent of the run workspace when no temp dir is given.
pub const DEFAULT_TEMP_DIR: &str = "/tmp";

/// Characters allowed in a type pattern.
pub const TYPE_PATTERN_CODES: &str = "NSsCc";

/// Coordinator connection and tool location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub address: String,
    pub port: u16,
    pub root: PathBuf,
}

impl StoreConfig {
    /// Folder holding the installation's executables.
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_DB_ADDRESS.to_string(),
            port: DEFAULT_DB_PORT,
            root: PathBuf::from(DEFAULT_DB_ROOT),
        }
    }
}

/// Arrays touched by the commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayConfig {
    pub load_name: Option<String>,
    pub load_schema: Option<String>,
    pub shadow_name: Option<String>,
    pub errors_allowed: u64,
    pub target_name: Option<String>,
    pub target_schema: Option<String>,
    pub remove_load_arrays: bool,
    pub remove_target_array: bool,
    pub transform: Transform,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            load_name: None,
            load_schema: None,
            shadow_name: None,
            errors_allowed: 0,
            target_name: None,
            target_schema: None,
            remove_load_arrays: false,
            remove_target_array: false,
            transform: Transform::Rsl,
        }
    }
}

impl ArrayConfig {
    /// Whether a load schema is known, by text or by array name.
    pub fn has_load_schema(&self) -> bool {
        self.load_name.is_some() || self.load_schema.is_some()
    }
}

/// Complete configuration of one run
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub store: StoreConfig,

    /// Input file; standard input when unset
    pub input: Option<PathBuf>,

    /// How long to wait for input to become readable; forever when unset
    pub input_timeout: Option<Duration>,

    pub skip: u64,
    pub delimiter: Option<String>,
    pub type_pattern: Option<String>,
    pub starting_coordinate: i64,
    pub chunk_size: u64,
    pub output_base: Option<String>,

    /// CSV hop (splitter to converters)
    pub csv_channels: HopConfig,

    /// Store-native hop (converters to the load)
    pub dlf_channels: HopConfig,

    pub ssh: SshOptions,
    pub arrays: ArrayConfig,

    /// Parent of the run workspace
    pub temp_dir: PathBuf,

    pub format: ConversionFormat,
    pub show_version: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            input: None,
            input_timeout: None,
            skip: 0,
            delimiter: None,
            type_pattern: None,
            starting_coordinate: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            output_base: None,
            csv_channels: HopConfig::default(),
            dlf_channels: HopConfig::default(),
            ssh: SshOptions::default(),
            arrays: ArrayConfig::default(),
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            format: ConversionFormat::Tsv,
            show_version: false,
        }
    }
}

impl LoadConfig {
    /// Build and validate the configuration from parsed flags.
    ///
    /// The conversion format is read from the environment at this point.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let config = Self {
            store: StoreConfig {
                address: cli.db_address.clone(),
                port: cli.db_port,
                root: expand_home(&cli.db_root),
            },
            input: cli.input.as_deref().map(expand_home),
            input_timeout: cli.input_timeout_ms.map(Duration::from_millis),
            skip: cli.skip,
            delimiter: cli.delimiter.clone(),
            type_pattern: cli.type_pattern.clone(),
            starting_coordinate: cli.starting_coordinate,
            chunk_size: cli.chunk_size,
            output_base: cli.output_base.as_deref().map(expand_home_str),
            csv_channels: HopConfig::new(ChannelKind::from_flag(cli.csv_files), cli.leave_csv_files),
            dlf_channels: HopConfig::new(ChannelKind::from_flag(cli.dlf_files), cli.leave_dlf_files),
            ssh: SshOptions {
                cipher: cli.ssh_cipher.clone(),
                port: cli.ssh_port,
                identity_file: cli.ssh_keyfile.as_deref().map(expand_home),
                username: cli.ssh_username.clone(),
                bypass_host_key_check: cli.ssh_bypass_key_check,
            },
            arrays: ArrayConfig {
                load_name: cli.load_name.clone(),
                load_schema: cli.load_schema.clone(),
                shadow_name: cli.shadow_name.clone(),
                errors_allowed: cli.errors_allowed,
                target_name: cli.target_name.clone(),
                target_schema: cli.target_schema.clone(),
                remove_load_arrays: cli.remove_load_arrays,
                remove_target_array: cli.remove_target_array,
                transform: cli.transform,
            },
            temp_dir: cli
                .temp_dir
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_DIR)),
            format: ConversionFormat::from_env(),
            show_version: cli.show_version,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject invalid combinations.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(LoadError::config("Chunk size must be greater than zero."));
        }
        if i64::try_from(self.chunk_size).is_err() {
            return Err(LoadError::config(format!(
                "Chunk size {} is out of range.",
                self.chunk_size
            )));
        }

        if self.arrays.target_name.is_some() && !self.arrays.has_load_schema() {
            return Err(LoadError::config(
                "When specifying a target array name, a load array name and/or load array schema must also be provided.",
            ));
        }
        if !self.arrays.has_load_schema() {
            return Err(LoadError::config(
                "A load array name and/or load array schema must be provided.",
            ));
        }
        // A schema alone names nothing to load into.
        if self.arrays.load_name.is_none() && self.arrays.target_name.is_none() {
            return Err(LoadError::config(
                "A load array schema without a load array name requires a target array name.",
            ));
        }

        if let Some(pattern) = &self.type_pattern {
            if pattern.is_empty() || !pattern.chars().all(|c| TYPE_PATTERN_CODES.contains(c)) {
                return Err(LoadError::config(format!(
                    "Invalid type pattern '{pattern}': expected only the characters {TYPE_PATTERN_CODES}."
                )));
            }
        }

        if let Some(delimiter) = &self.delimiter {
            if delimiter.is_empty() {
                return Err(LoadError::config("Delimiter must not be empty."));
            }
        }

        // An explicit load schema must parse and be one-dimensional before anything runs.
        self.explicit_load_schema()?;

        if self.csv_channels.retain && self.csv_channels.kind == ChannelKind::Fifo {
            warn!("Leaving CSV fragments has no effect without CSV fragment files (-m).");
        }
        if self.dlf_channels.retain && self.dlf_channels.kind == ChannelKind::Fifo {
            warn!("Leaving DLF fragments has no effect without DLF fragment files (-M).");
        }
        if self.arrays.target_schema.is_some() && self.arrays.target_name.is_none() {
            warn!("Target array schema ignored: no target array name was provided.");
        }

        Ok(())
    }

    /// Parsed `--load-schema`, if one was given.
    pub fn explicit_load_schema(&self) -> Result<Option<Schema>> {
        let Some(text) = &self.arrays.load_schema else {
            return Ok(None);
        };
        let schema: Schema = text.parse()?;
        schema.single_dimension()?;
        Ok(Some(schema))
    }
}

fn expand_home_str(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => path.to_string(),
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
