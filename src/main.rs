//! Flowbox - sandboxed flow-step execution
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use flowbox::cli::{Cli, Commands};
use flowbox::config::{Config, ConfigManager};
use flowbox::error::FlowboxResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> FlowboxResult<()> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;

    init_logging(cli.verbose, &config);
    debug!("Loaded configuration from {}", manager.path().display());

    match cli.command {
        Commands::Run(args) => flowbox::cli::commands::run(args, &config).await,
        Commands::Status(args) => flowbox::cli::commands::status(args, &config).await,
        Commands::Config(args) => flowbox::cli::commands::config(args, &manager, &config).await,
        Commands::Cache(args) => flowbox::cli::commands::cache(args, &config).await,
    }
}

/// 0 = warn, 1 = info, 2+ = debug; `general.verbose` raises the floor to info.
/// Logs go to stderr so `run` output stays parseable.
fn init_logging(verbose: u8, config: &Config) {
    let level = match verbose.max(u8::from(config.general.verbose)) {
        0 => "flowbox=warn",
        1 => "flowbox=info",
        _ => "flowbox=debug",
    };
    let filter = EnvFilter::new(level);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
