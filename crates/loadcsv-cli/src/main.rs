//! loadcsv - Main entry point

use clap::Parser;
use loadcsv_cli::{Cli, LoadConfig, LoadRun};
use loadcsv_common::logging::{init_logging, ConsoleStream, LogConfig, LogLevel, LogOutput};
use std::process;
use tracing::{error, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // A missing .env file is not an error
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    // Keep stdout free for the report in JSON mode
    let console = if cli.report_json {
        ConsoleStream::Stderr
    } else {
        ConsoleStream::Stdout
    };
    let base = LogConfig::builder()
        .level(LogLevel::from_flags(cli.quiet, cli.verbose))
        .output(LogOutput::Console)
        .console(console)
        .log_file_prefix("loadcsv")
        .build();

    // Environment variables take precedence over flags
    let (log_config, env_error) = match LogConfig::from_env_over(base.clone()) {
        Ok(config) => (config, None),
        Err(e) => (base, Some(e)),
    };

    // The loader works without logging
    let guard = init_logging(&log_config).ok();
    if let Some(e) = env_error {
        warn!(error = %e, "Ignoring invalid logging environment");
    }

    let config = match LoadConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, category = ?e.category(), "Invalid configuration");
            print_error_frame(&e.to_string());
            drop(guard);
            process::exit(2);
        },
    };

    let report = LoadRun::new(config).execute().await;

    if !cli.report_json {
        if let Some(version) = &report.version {
            println!("{}", version.trim_end());
        }
    }
    if let Some(message) = &report.error {
        print_error_frame(message);
    }
    if cli.report_json {
        match report.to_json() {
            Ok(json) => println!("{json}"),
            Err(e) => error!(error = %e, "Failed to serialize run report"),
        }
    }

    drop(guard);
    process::exit(report.exit_code);
}

fn print_error_frame(message: &str) {
    eprintln!("##### ERROR ##################");
    eprintln!("{}", message.trim_end());
    eprintln!("##############################");
}
