//! Local stages storage (`:local`) backed by podman images
//!
//! Stages are local images labelled with the project name, their digest and
//! their parent's digest. Deletion is by image id.

use super::factory::RegistryOptions;
use super::skopeo::stage_from_labels;
use super::{backend_error, labels, Stage, StageStorage};
use crate::error::{KeelError, KeelResult};
use crate::exec::CommandRunner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodmanImage {
    id: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    created: Option<i64>,
}

/// Parse `podman images --format json`, keeping images with a stage digest
pub fn parse_podman_images(json: &str) -> KeelResult<Vec<Stage>> {
    let images: Vec<PodmanImage> = serde_json::from_str(json)?;

    Ok(images
        .into_iter()
        .filter_map(|image| {
            let labels = image.labels.unwrap_or_default();
            let digest = labels.get(labels::STAGE_DIGEST)?;
            let created_at = image
                .created
                .and_then(|ts| DateTime::from_timestamp(ts, 0))
                .unwrap_or_else(Utc::now);
            Some(stage_from_labels(digest, image.id, &labels, created_at))
        })
        .collect())
}

/// Stages kept as local podman images
pub struct PodmanStagesStorage {
    runner: CommandRunner,
    project: String,
}

impl PodmanStagesStorage {
    pub fn new(project: impl Into<String>, options: &RegistryOptions) -> Self {
        Self {
            runner: CommandRunner::new(options.podman_bin.clone()),
            project: project.into(),
        }
    }
}

#[async_trait]
impl StageStorage for PodmanStagesStorage {
    fn address(&self) -> &str {
        ":local"
    }

    async fn list_stages(&self) -> KeelResult<Vec<Stage>> {
        let args = vec![
            "images".to_string(),
            "--filter".to_string(),
            format!("label={}={}", labels::PROJECT, self.project),
            "--format".to_string(),
            "json".to_string(),
        ];

        let out = self.runner.run(&args).await.map_err(|e| match e {
            e @ KeelError::CliNotFound { .. } => e,
            other => KeelError::StorageUnreachable {
                storage: ":local".to_string(),
                reason: other.to_string(),
            },
        })?;

        parse_podman_images(&out)
    }

    async fn delete_stage(&self, stage: &Stage) -> KeelResult<()> {
        let args = vec!["rmi".to_string(), stage.location.clone()];
        self.runner
            .run(&args)
            .await
            .map(|_| ())
            .map_err(|e| {
                backend_error(e, |reason| KeelError::StageDelete {
                    digest: stage.digest.clone(),
                    reason,
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_images_with_parents() {
        let json = r#"[
            {"Id": "1111", "Labels": {"keel.project": "demo", "keel.stage-digest": "root"}, "Created": 1700000000},
            {"Id": "2222", "Labels": {"keel.project": "demo", "keel.stage-digest": "child", "keel.stage-parent": "root"}, "Created": 1700000100}
        ]"#;

        let stages = parse_podman_images(json).unwrap();

        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].digest, "root");
        assert_eq!(stages[0].parent_digest, None);
        assert_eq!(stages[1].parent_digest.as_deref(), Some("root"));
        assert_eq!(stages[1].location, "2222");
        assert_eq!(stages[1].created_at.timestamp(), 1700000100);
    }

    #[test]
    fn parse_skips_unlabelled_images() {
        let json = r#"[{"Id": "3333", "Labels": null}]"#;
        assert!(parse_podman_images(json).unwrap().is_empty());
    }

    #[test]
    fn parse_empty_list() {
        assert!(parse_podman_images("[]").unwrap().is_empty());
    }
}
