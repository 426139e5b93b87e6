//! Cleanup report
//!
//! The same structure is produced by dry and real runs; in a dry run the
//! `deleted` lists hold what would have been deleted.

use crate::policy::Reason;
use crate::registry::{ImageTag, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    AcquiringLock,
    ImagesPhase,
    StagesPhase,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::AcquiringLock => "acquiring lock",
            Self::ImagesPhase => "images phase",
            Self::StagesPhase => "stages phase",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A single tag or stage whose deletion failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    /// Tag reference or stage digest
    pub item: String,
    pub reason: String,
}

/// Decision recorded for one tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRecord {
    pub image: String,
    pub tag: String,
    pub reference: String,
    pub reason: Reason,
    pub created_at: DateTime<Utc>,
}

impl TagRecord {
    pub fn new(tag: &ImageTag, reference: String, reason: Reason) -> Self {
        Self {
            image: tag.image_name.clone(),
            tag: tag.tag.clone(),
            reference,
            reason,
            created_at: tag.created_at,
        }
    }
}

/// A stage selected for deletion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub digest: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Stage> for StageRecord {
    fn from(stage: &Stage) -> Self {
        Self {
            digest: stage.digest.clone(),
            location: stage.location.clone(),
            created_at: stage.created_at,
        }
    }
}

/// Images phase results
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImagesReport {
    pub kept: Vec<TagRecord>,
    pub deleted: Vec<TagRecord>,
    pub failures: Vec<ItemFailure>,
    /// Listed tags that could not be inspected; their stages are unknown
    pub unreadable: Vec<String>,
    /// Tags still present after the phase; input to stage collection
    #[serde(skip)]
    pub survivors: Vec<ImageTag>,
}

/// Stages phase results
#[derive(Debug, Clone, Default, Serialize)]
pub struct StagesReport {
    /// Stages reachable from a surviving tag
    pub retained: usize,
    pub deleted: Vec<StageRecord>,
    pub failures: Vec<ItemFailure>,
    /// Not attempted: a descendant could not be deleted
    pub skipped: Vec<StageRecord>,
}

/// Aggregated result of one cleanup run
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub project: String,
    pub dry_run: bool,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Degraded cluster protection and similar non-fatal conditions
    pub warnings: Vec<String>,
    pub images: ImagesReport,
    pub stages: StagesReport,
}

impl CleanupReport {
    pub fn new(project: impl Into<String>, dry_run: bool) -> Self {
        Self {
            project: project.into(),
            dry_run,
            state: RunState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            warnings: Vec::new(),
            images: ImagesReport::default(),
            stages: StagesReport::default(),
        }
    }

    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    pub fn failure_count(&self) -> usize {
        self.images.failures.len() + self.stages.failures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_without_survivors() {
        let mut report = CleanupReport::new("shop", true);
        report.finish(RunState::Done);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["project"], "shop");
        assert_eq!(json["state"], "done");
        assert_eq!(json["dry_run"], true);
        assert!(json["images"].get("survivors").is_none());
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn state_display() {
        assert_eq!(RunState::AcquiringLock.to_string(), "acquiring lock");
    }
}
