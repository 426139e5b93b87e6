//! Cleanup run: images phase, then stages phase, under the project lock

mod coordinator;
mod images;
mod report;
mod stages;

pub use coordinator::{Coordinator, RunFailure};
pub use images::{surviving_digests, ImagesCleaner};
pub use report::{
    CleanupReport, ImagesReport, ItemFailure, RunState, StageRecord, StagesReport, TagRecord,
};
pub use stages::{enumerate, StageCollector, StageGraph};

use crate::policy::CleanupPolicy;

/// Default size of the deletion worker pool
pub const DEFAULT_WORKERS: usize = 8;

/// Everything a single run needs; immutable once the run starts
#[derive(Debug, Clone)]
pub struct CleanupRunOptions {
    pub project_name: String,
    /// Image names of the project (empty string for the nameless image)
    pub image_names: Vec<String>,
    pub policies: Vec<CleanupPolicy>,
    /// Decide and report without deleting
    pub dry_run: bool,
    /// Skip the cluster scan; no tag is protected by live workloads
    pub without_kube: bool,
    /// Concurrent deletions per phase
    pub workers: usize,
}
