//! Audit trail of cleanup runs
//!
//! One JSON object per line in `<state dir>/keel/audit.log`: the run start,
//! every tag or stage actually removed, and the run outcome. Dry runs record
//! start and outcome only. `general.audit_log = false` turns it off.

use crate::cleanup::RunState;
use crate::config::{schema::Config, ConfigManager};
use crate::policy::Reason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Something worth keeping a record of
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum AuditEvent<'a> {
    #[serde(rename = "cleanup.started")]
    CleanupStarted {
        project: &'a str,
        images_repo: &'a str,
        stages_storage: &'a str,
        dry_run: bool,
    },
    #[serde(rename = "cleanup.tag_deleted")]
    TagDeleted { reference: &'a str, reason: Reason },
    #[serde(rename = "cleanup.stage_deleted")]
    StageDeleted { digest: &'a str, location: &'a str },
    #[serde(rename = "cleanup.finished")]
    CleanupFinished {
        project: &'a str,
        tags_deleted: usize,
        stages_deleted: usize,
        failures: usize,
        dry_run: bool,
    },
    #[serde(rename = "cleanup.failed")]
    CleanupFailed {
        project: &'a str,
        during: RunState,
        error: String,
    },
}

#[derive(Serialize)]
struct Entry<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent<'a>,
}

/// Append-only JSON-lines sink
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Logger at the state directory, unless the config disables it
    pub fn new(config: &Config) -> Self {
        Self {
            path: config
                .general
                .audit_log
                .then(ConfigManager::audit_log_path),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Append an event. Write failures are logged, never returned.
    pub async fn record(&self, event: &AuditEvent<'_>) {
        let Some(ref path) = self.path else {
            return;
        };

        let entry = Entry {
            timestamp: Utc::now(),
            event,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(json) => json + "\n",
            Err(e) => {
                warn!("Audit event not serializable: {}", e);
                return;
            }
        };

        let written = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        };
        if let Err(e) = written.await {
            warn!("Audit log {} not written: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn event_fields_are_top_level() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.log");
        let audit = AuditLog::at(&path);

        audit
            .record(&AuditEvent::TagDeleted {
                reference: "registry.example.com/shop/api:old",
                reason: Reason::Orphan,
            })
            .await;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["event"], "cleanup.tag_deleted");
        assert_eq!(lines[0]["reference"], "registry.example.com/shop/api:old");
        assert_eq!(lines[0]["reason"], "orphan");
        assert!(lines[0]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn appends_and_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("audit.log");
        let audit = AuditLog::at(&path);

        audit
            .record(&AuditEvent::StageDeleted {
                digest: "s-old",
                location: "stages:s-old",
            })
            .await;
        audit
            .record(&AuditEvent::CleanupFailed {
                project: "shop",
                during: RunState::StagesPhase,
                error: "cycle".to_string(),
            })
            .await;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["during"], "stages-phase");
    }

    #[tokio::test]
    async fn disabled_log_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.general.audit_log = false;

        let audit = AuditLog::new(&config);
        audit
            .record(&AuditEvent::StageDeleted {
                digest: "s-old",
                location: "stages:s-old",
            })
            .await;

        assert!(audit.path.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
