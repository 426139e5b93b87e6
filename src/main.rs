//! Keel - policy-driven cleanup for container build caches and registries
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use keel::cli::{Cli, Commands};
use keel::config::ConfigManager;
use keel::error::{KeelError, KeelResult};
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

async fn run() -> KeelResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config.general.log_format);
    debug!("Using config {}", config_manager.path().display());

    let project_dir = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir()
            .map_err(|e| KeelError::io("getting current directory", e))?,
    };

    match cli.command {
        Commands::Cleanup(args) => keel::cli::commands::cleanup(args, &config, &project_dir).await,
    }
}

/// 0 = warn (spinners only), 1 = info, 2+ = debug; logs go to stderr so
/// `--format json` keeps stdout clean
fn init_logging(verbose: u8, format: &str) {
    let filter = match verbose {
        0 => EnvFilter::new("keel=warn"),
        1 => EnvFilter::new("keel=info"),
        _ => EnvFilter::new("keel=debug"),
    };

    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }
}
