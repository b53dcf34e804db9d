//! Build automation tasks for loadcsv
//!
//! - Generating the CLI reference from the clap definitions

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for loadcsv", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in Markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<loadcsv_cli::Cli>();

    let content = format!(
        r#"# loadcsv CLI Reference

This documentation is generated from the CLI source code. Last updated: {}.

## Overview

`loadcsv` splits one CSV input across every instance of the cluster, converts each
fragment to the store's native load format on its own instance, and loads the result
into a load array, optionally redimensioning it into a target array. A run either
commits completely or removes everything it created.

## Quick Start

```bash
# Load a file into an existing one-dimensional array
loadcsv -i data.csv -a raw

# Create the load array, then redimension into a target
loadcsv -i data.csv -a raw -s '<id:int64,name:string>[i=0:*,500000,0]' -x \
  -A people -S '<name:string>[id=0:*,1000,0]'

# Read standard input, keep fragments on disk for inspection
zcat data.csv.gz | loadcsv -a raw -m -l -M -L -o /tmp/frags/
```

## Exit Status

- `0` data loaded
- `1` no input data was found
- `2` an error was encountered; everything the run created has been removed

## Commands

{}

## Environment Variables

- `LOADCSV_DB_ADDRESS`, `LOADCSV_DB_PORT`, `LOADCSV_DB_ROOT`, `LOADCSV_TEMP_DIR` - defaults for the matching options
- `SCIDB_USE_CSV` - any non-empty value selects the legacy `csv2scidb` converter
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE_PREFIX`, `LOG_FILTER` - logging overrides

---

*To update, run `cargo xtask generate-cli-docs`.*
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;

    let file_path = output_path.join("cli.md");
    fs::write(&file_path, content)?;

    println!("Generated CLI documentation at: {}", file_path.display());

    Ok(())
}
