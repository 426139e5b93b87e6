//! Run orchestration
//!
//! ```text
//! Idle -> AcquiringLock -> ImagesPhase -> StagesPhase -> Done
//!              \________________\_____________\______-> Failed
//! ```
//!
//! The project lock is taken before any snapshot and held until both phases
//! finish. It is released on every return path; if the run future is
//! dropped (interrupt), the handle's drop releases it.

use super::images::ImagesCleaner;
use super::report::{CleanupReport, RunState};
use super::stages::{self, StageCollector};
use super::CleanupRunOptions;
use crate::audit::{AuditEvent, AuditLog};
use crate::error::{KeelError, KeelResult};
use crate::git::RefSource;
use crate::kube::{self, WorkloadLister};
use crate::lock::{project_lock_key, LockManager, LockWatch};
use crate::registry::{ImageRegistry, StageStorage};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A fatal error together with whatever the run completed before it
#[derive(Debug)]
pub struct RunFailure {
    pub error: KeelError,
    /// State the run was in when it failed
    pub during: RunState,
    pub report: CleanupReport,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (during {})", self.error, self.during)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Drives one cleanup run against its collaborators
pub struct Coordinator {
    registry: Arc<dyn ImageRegistry>,
    storage: Arc<dyn StageStorage>,
    refs: Arc<dyn RefSource>,
    workloads: Arc<dyn WorkloadLister>,
    locks: Arc<dyn LockManager>,
    audit: AuditLog,
    clock: Option<DateTime<Utc>>,
    state: RunState,
    lock_watch: Option<LockWatch>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<dyn ImageRegistry>,
        storage: Arc<dyn StageStorage>,
        refs: Arc<dyn RefSource>,
        workloads: Arc<dyn WorkloadLister>,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self {
            registry,
            storage,
            refs,
            workloads,
            locks,
            audit: AuditLog::disabled(),
            clock: None,
            state: RunState::Idle,
            lock_watch: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Evaluate ages against a fixed instant instead of the wall clock
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.clock = Some(now);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// State of the lock taken by the last run
    pub fn lock_watch(&self) -> Option<&LockWatch> {
        self.lock_watch.as_ref()
    }

    fn enter(&mut self, state: RunState, report: &mut CleanupReport) {
        debug!("Cleanup state: {} -> {}", self.state, state);
        self.state = state;
        report.state = state;
    }

    /// Run both phases under the project lock
    pub async fn run(&mut self, options: &CleanupRunOptions) -> Result<CleanupReport, RunFailure> {
        let mut report = CleanupReport::new(&options.project_name, options.dry_run);
        let key = project_lock_key(&options.project_name);

        self.enter(RunState::AcquiringLock, &mut report);
        let handle = match self.locks.acquire(&key).await {
            Ok(handle) => handle,
            Err(error) => return Err(self.fail(error, report).await),
        };
        self.lock_watch = Some(handle.watch());
        info!("Acquired lock {}", key);

        self.audit
            .record(&AuditEvent::CleanupStarted {
                project: &options.project_name,
                images_repo: self.registry.address(),
                stages_storage: self.storage.address(),
                dry_run: options.dry_run,
            })
            .await;

        let result = self.run_phases(options, &mut report).await;
        handle.release();

        match result {
            Ok(()) => {
                report.finish(RunState::Done);
                self.state = RunState::Done;
                self.audit
                    .record(&AuditEvent::CleanupFinished {
                        project: &options.project_name,
                        tags_deleted: report.images.deleted.len(),
                        stages_deleted: report.stages.deleted.len(),
                        failures: report.failure_count(),
                        dry_run: options.dry_run,
                    })
                    .await;
                Ok(report)
            }
            Err(error) => Err(self.fail(error, report).await),
        }
    }

    async fn run_phases(
        &mut self,
        options: &CleanupRunOptions,
        report: &mut CleanupReport,
    ) -> KeelResult<()> {
        self.enter(RunState::ImagesPhase, report);
        let now = self.clock.unwrap_or_else(Utc::now);
        let snapshot = self.refs.snapshot()?;
        let scan = kube::scan(self.workloads.as_ref(), options.without_kube).await?;
        report.warnings.extend(scan.warnings);

        ImagesCleaner::new(self.registry.as_ref(), &self.audit, options.workers)
            .clean(options, &snapshot, &scan.live, now, &mut report.images)
            .await?;
        info!(
            "Images phase: {} kept, {} deleted, {} failed",
            report.images.kept.len(),
            report.images.deleted.len(),
            report.images.failures.len()
        );

        self.enter(RunState::StagesPhase, report);
        let graph = stages::enumerate(self.storage.as_ref()).await?;

        // an uninspected tag may depend on any stage
        if !report.images.unreadable.is_empty() {
            let warning = format!(
                "Stage collection skipped: {} tags could not be inspected",
                report.images.unreadable.len()
            );
            warn!("{}", warning);
            report.warnings.push(warning);
            report.stages.retained = graph.len();
            return Ok(());
        }

        StageCollector::new(self.storage.as_ref(), &self.audit, options.workers)
            .collect(&graph, &report.images.survivors, options.dry_run, &mut report.stages)
            .await?;
        info!(
            "Stages phase: {} retained, {} deleted, {} failed",
            report.stages.retained,
            report.stages.deleted.len(),
            report.stages.failures.len()
        );

        Ok(())
    }

    async fn fail(&mut self, error: KeelError, mut report: CleanupReport) -> RunFailure {
        let during = self.state;
        report.finish(RunState::Failed);
        self.state = RunState::Failed;
        self.audit
            .record(&AuditEvent::CleanupFailed {
                project: &report.project,
                during,
                error: error.to_string(),
            })
            .await;
        RunFailure {
            error,
            during,
            report,
        }
    }
}
