//! Error types for keel
//!
//! All modules use `KeelResult<T>` as their return type. Errors returned
//! through `Result` abort the current run; per-item failures (a single tag or
//! stage that could not be deleted) are recorded in the cleanup report
//! instead, see [`crate::cleanup::ItemFailure`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for keel operations
pub type KeelResult<T> = Result<T, KeelError>;

/// All errors that can occur in keel
#[derive(Error, Debug)]
pub enum KeelError {
    // Lock errors
    #[error("Project lock {key} is held by another process")]
    LockUnavailable { key: String },

    #[error("Failed to acquire lock {key}: {source}")]
    LockFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },

    // Git errors
    #[error("Git repository at {path} is unreadable: {source}")]
    GitRepoCorrupt {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },

    // Registry and storage errors
    #[error("Images repo {repo} is unreachable: {reason}")]
    RegistryUnreachable { repo: String, reason: String },

    #[error("Failed to delete tag {reference}: {reason}")]
    TagDelete { reference: String, reason: String },

    #[error("Stages storage {storage} is unreachable: {reason}")]
    StorageUnreachable { storage: String, reason: String },

    #[error("Failed to delete stage {digest}: {reason}")]
    StageDelete { digest: String, reason: String },

    #[error("Stage graph contains a cycle through {digest}; stages storage is corrupt")]
    StageCycle { digest: String },

    #[error("Every deletion in the {phase} phase failed ({failed} failures)")]
    PhaseFailed { phase: String, failed: usize },

    // Cluster errors
    #[error("Kubernetes cluster is unreachable: {0}")]
    KubeUnreachable(String),

    #[error("Failed to scan namespace {namespace}: {reason}")]
    NamespaceScan { namespace: String, reason: String },

    // Policy errors
    #[error("Invalid cleanup policy '{spec}': {reason}")]
    PolicyInvalid { spec: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Project config (.keel.toml) not found from {0}")]
    ProjectConfigNotFound(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Required CLI not found: {name}. {hint}")]
    CliNotFound { name: String, hint: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    #[error("Interrupted")]
    Interrupted,

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeelError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Whether this error must halt the run.
    ///
    /// Per-item deletion failures and single namespace scan failures are
    /// recorded and the run continues; everything else aborts.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::TagDelete { .. } | Self::StageDelete { .. } | Self::NamespaceScan { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::LockUnavailable { .. } => {
                Some("Another cleanup or build is running; retry later or raise cleanup.lock_wait")
            }
            Self::KubeUnreachable(_) => {
                Some("Check --kube-config/--kube-context, or pass --without-kube to skip cluster protection")
            }
            Self::ProjectConfigNotFound(_) => {
                Some("Create .keel.toml with a [project] section (name, images)")
            }
            Self::StageCycle { .. } => Some("Inspect the stages storage; stage parent labels form a loop"),
            Self::GitRepoCorrupt { .. } => Some("Run: git fsck"),
            _ => None,
        }
    }
}
