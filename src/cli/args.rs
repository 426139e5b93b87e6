//! CLI argument definitions using clap derive

use crate::registry::StagesStorageRef;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Keel - policy-driven cleanup of published images and cached build stages
///
/// Deletes registry tags that no cleanup policy keeps and no running
/// workload uses, then removes build stages no surviving tag depends on.
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KEEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Project directory (defaults to current directory)
    #[arg(long, global = true, env = "KEEL_DIR")]
    pub dir: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Remove unused image tags, then unreachable build stages
    Cleanup(CleanupArgs),
}

/// Arguments for the cleanup command
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Stages storage: `:local` or a repository address
    #[arg(long, env = "KEEL_STAGES_STORAGE", value_name = "REF")]
    pub stages_storage: StagesStorageRef,

    /// Repository the project's images are published to
    #[arg(long, env = "KEEL_IMAGES_REPO", value_name = "REF")]
    pub images_repo: String,

    /// Directory with a docker config.json holding registry credentials
    #[arg(long, env = "KEEL_DOCKER_CONFIG", value_name = "PATH")]
    pub docker_config: Option<PathBuf>,

    /// Talk to the repository over plain HTTP or unverified TLS
    #[arg(long)]
    pub insecure_repo: bool,

    /// Policies replacing the project's, e.g. "branch:*,keep=5;tag:v*,expire=90d"
    #[arg(long, env = "KEEL_IMAGES_CLEANUP_POLICIES", value_name = "SPEC")]
    pub images_cleanup_policies: Option<String>,

    /// kubeconfig used to find live workloads
    #[arg(long, env = "KEEL_KUBE_CONFIG", value_name = "PATH")]
    pub kube_config: Option<PathBuf>,

    /// kubeconfig context used to find live workloads
    #[arg(long, env = "KEEL_KUBE_CONTEXT", value_name = "NAME")]
    pub kube_context: Option<String>,

    /// Report what would be deleted without deleting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Do not consult the cluster; running images get no protection
    #[arg(long)]
    pub without_kube: bool,

    /// Concurrent deletions (default: from config)
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Report format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Output format for the cleanup report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
}
