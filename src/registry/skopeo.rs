//! Registry access through the `skopeo` CLI
//!
//! Used for the images repo and for stages storage kept in a registry
//! repository (one tag per stage digest). Only `list-tags`, `inspect` and
//! `delete` are needed.

use super::factory::RegistryOptions;
use super::{backend_error, image_repository, labels, ImageRegistry, ImageTag, Stage, StageStorage, TagListing, UnreadableTag};
use crate::error::{KeelError, KeelResult};
use crate::exec::CommandRunner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Parallel `inspect` calls while listing a repository
const INSPECT_CONCURRENCY: usize = 8;

/// Stderr fragments meaning the repository or manifest does not exist
const NOT_FOUND_MARKERS: &[&str] = &["manifest unknown", "name unknown", "not found"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectOutput {
    #[serde(default)]
    digest: Option<String>,
    #[serde(default)]
    created: Option<DateTime<Utc>>,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

/// Metadata of one manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectInfo {
    /// Manifest digest the inspected tag resolves to
    pub digest: Option<String>,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

/// Parse `skopeo list-tags` output
pub fn parse_tag_list(json: &str) -> KeelResult<Vec<String>> {
    let list: TagList = serde_json::from_str(json)?;
    Ok(list.tags)
}

/// Parse `skopeo inspect` output
pub fn parse_inspect(json: &str) -> KeelResult<InspectInfo> {
    let output: InspectOutput = serde_json::from_str(json)?;
    Ok(InspectInfo {
        digest: output.digest,
        created_at: output.created.unwrap_or_else(Utc::now),
        labels: output.labels.unwrap_or_default(),
    })
}

fn is_not_found(err: &KeelError) -> bool {
    match err {
        KeelError::CommandExecution { stderr, .. } => {
            let stderr = stderr.to_lowercase();
            NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m))
        }
        _ => false,
    }
}

/// Thin wrapper over the skopeo binary
#[derive(Debug, Clone)]
pub struct SkopeoClient {
    runner: CommandRunner,
    tls_verify: bool,
    authfile: Option<PathBuf>,
}

impl SkopeoClient {
    pub fn new(options: &RegistryOptions) -> Self {
        Self {
            runner: CommandRunner::new(options.skopeo_bin.clone()),
            tls_verify: !options.insecure,
            authfile: options.docker_config.as_ref().map(|d| d.join("config.json")),
        }
    }

    fn args(&self, subcommand: &str, extra: &[&str], reference: &str) -> Vec<String> {
        let mut args = vec![subcommand.to_string()];
        if !self.tls_verify {
            args.push("--tls-verify=false".to_string());
        }
        if let Some(ref authfile) = self.authfile {
            args.push("--authfile".to_string());
            args.push(authfile.display().to_string());
        }
        args.extend(extra.iter().map(|s| s.to_string()));
        args.push(format!("docker://{}", reference));
        args
    }

    /// Tags of a repository; `None` if the repository does not exist yet
    pub async fn list_tags(&self, repository: &str) -> KeelResult<Option<Vec<String>>> {
        match self.runner.run(&self.args("list-tags", &[], repository)).await {
            Ok(out) => parse_tag_list(&out).map(Some),
            Err(e) if is_not_found(&e) => {
                debug!("Repository {} does not exist", repository);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Manifest metadata; `None` if the reference vanished meanwhile
    pub async fn inspect(&self, reference: &str) -> KeelResult<Option<InspectInfo>> {
        match self
            .runner
            .run(&self.args("inspect", &["--no-tags"], reference))
            .await
        {
            Ok(out) => parse_inspect(&out).map(Some),
            Err(e) if is_not_found(&e) => {
                debug!("Reference {} disappeared while listing", reference);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete(&self, reference: &str) -> KeelResult<()> {
        self.runner
            .run(&self.args("delete", &[], reference))
            .await
            .map(|_| ())
    }

    /// List and inspect every tag of a repository.
    ///
    /// Only the listing can fail as a whole; each tag carries its own
    /// inspect result. Tags that vanished meanwhile are dropped.
    async fn inspect_all(
        &self,
        repository: &str,
    ) -> KeelResult<Vec<(String, KeelResult<InspectInfo>)>> {
        let Some(tags) = self.list_tags(repository).await? else {
            return Ok(vec![]);
        };

        let results: Vec<(String, Option<KeelResult<InspectInfo>>)> = stream::iter(tags)
            .map(|tag| async move {
                let reference = format!("{}:{}", repository, tag);
                let info = self.inspect(&reference).await.transpose();
                (tag, info)
            })
            .buffered(INSPECT_CONCURRENCY)
            .collect()
            .await;

        Ok(results
            .into_iter()
            .filter_map(|(tag, info)| info.map(|info| (tag, info)))
            .collect())
    }
}

/// Images repo in a registry
pub struct SkopeoImagesRepo {
    client: SkopeoClient,
    repo: String,
}

impl SkopeoImagesRepo {
    pub fn new(repo: impl Into<String>, options: &RegistryOptions) -> Self {
        Self {
            client: SkopeoClient::new(options),
            repo: repo.into(),
        }
    }
}

#[async_trait]
impl ImageRegistry for SkopeoImagesRepo {
    fn address(&self) -> &str {
        &self.repo
    }

    async fn list_tags(&self, image_name: &str) -> KeelResult<TagListing> {
        let repository = image_repository(&self.repo, image_name);

        let inspected = self.client.inspect_all(&repository).await.map_err(|e| {
            backend_error(e, |reason| KeelError::RegistryUnreachable {
                repo: repository.clone(),
                reason,
            })
        })?;

        let mut listing = TagListing::default();
        for (tag, result) in inspected {
            match result {
                Ok(info) => listing.tags.push(
                    ImageTag::from_labels(image_name, &tag, &info.labels, info.created_at)
                        .with_manifest_digest(info.digest),
                ),
                Err(e) => {
                    warn!("Cannot inspect {}:{}: {}", repository, tag, e);
                    listing.unreadable.push(UnreadableTag {
                        image_name: image_name.to_string(),
                        tag,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(listing)
    }

    async fn delete_tag(&self, tag: &ImageTag) -> KeelResult<()> {
        let reference = tag.reference(&self.repo);
        match self.client.delete(&reference).await {
            Ok(()) => Ok(()),
            // another tag of the same manifest was deleted first
            Err(e) if is_not_found(&e) => {
                debug!("{} already gone", reference);
                Ok(())
            }
            Err(e) => Err(backend_error(e, |reason| KeelError::TagDelete {
                reference,
                reason,
            })),
        }
    }
}

/// Stages storage kept as tags of a registry repository
pub struct SkopeoStagesStorage {
    client: SkopeoClient,
    repo: String,
}

impl SkopeoStagesStorage {
    pub fn new(repo: impl Into<String>, options: &RegistryOptions) -> Self {
        Self {
            client: SkopeoClient::new(options),
            repo: repo.into(),
        }
    }
}

/// Stage record from a manifest; the tag doubles as the digest when the
/// label is missing
pub(crate) fn stage_from_labels(
    tag: &str,
    location: String,
    labels: &HashMap<String, String>,
    created_at: DateTime<Utc>,
) -> Stage {
    Stage {
        digest: labels
            .get(labels::STAGE_DIGEST)
            .cloned()
            .unwrap_or_else(|| tag.to_string()),
        parent_digest: labels
            .get(labels::STAGE_PARENT)
            .filter(|p| !p.is_empty())
            .cloned(),
        location,
        created_at,
    }
}

#[async_trait]
impl StageStorage for SkopeoStagesStorage {
    fn address(&self) -> &str {
        &self.repo
    }

    /// A stage that cannot be inspected leaves a hole in the parent chains,
    /// so it fails the listing.
    async fn list_stages(&self) -> KeelResult<Vec<Stage>> {
        let unreachable = |e| {
            backend_error(e, |reason| KeelError::StorageUnreachable {
                storage: self.repo.clone(),
                reason,
            })
        };
        let inspected = self
            .client
            .inspect_all(&self.repo)
            .await
            .map_err(unreachable)?;

        let mut stages = Vec::with_capacity(inspected.len());
        for (tag, result) in inspected {
            let info = result.map_err(unreachable)?;
            let location = format!("{}:{}", self.repo, tag);
            stages.push(stage_from_labels(&tag, location, &info.labels, info.created_at));
        }
        Ok(stages)
    }

    async fn delete_stage(&self, stage: &Stage) -> KeelResult<()> {
        self.client
            .delete(&stage.location)
            .await
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
    fn parse_tag_list_output() {
        let json = r#"{"Repository": "registry.example.com/proj/app", "Tags": ["main", "v1.0.0"]}"#;
        assert_eq!(parse_tag_list(json).unwrap(), vec!["main", "v1.0.0"]);
    }

    #[test]
    fn parse_tag_list_without_tags() {
        let json = r#"{"Repository": "registry.example.com/proj/app"}"#;
        assert!(parse_tag_list(json).unwrap().is_empty());
    }

    #[test]
    fn parse_inspect_output() {
        let json = r#"{
            "Name": "registry.example.com/proj/app",
            "Digest": "sha256:0000",
            "Created": "2024-01-15T10:00:00.123456789Z",
            "Labels": {"keel.stage-digest": "abc", "keel.tag-scheme": "git-branch"}
        }"#;
        let info = parse_inspect(json).unwrap();
        assert_eq!(info.created_at.to_rfc3339(), "2024-01-15T10:00:00.123456789+00:00");
        assert_eq!(info.labels.get(labels::STAGE_DIGEST).unwrap(), "abc");
        assert_eq!(info.digest.as_deref(), Some("sha256:0000"));
    }

    #[test]
    fn parse_inspect_null_labels() {
        let json = r#"{"Created": "2024-01-15T10:00:00Z", "Labels": null}"#;
        assert!(parse_inspect(json).unwrap().labels.is_empty());
    }

    #[test]
    fn not_found_detection() {
        let gone = KeelError::command_exec("skopeo inspect", "Error: manifest unknown: manifest unknown");
        let denied = KeelError::command_exec("skopeo delete", "unauthorized: access denied");
        assert!(is_not_found(&gone));
        assert!(!is_not_found(&denied));
    }

    #[test]
    fn args_carry_registry_options() {
        let options = RegistryOptions {
            insecure: true,
            docker_config: Some(PathBuf::from("/home/ci/.docker")),
            ..RegistryOptions::default()
        };
        let client = SkopeoClient::new(&options);

        let args = client.args("inspect", &["--no-tags"], "registry.local/app:main");
        assert_eq!(
            args,
            vec![
                "inspect",
                "--tls-verify=false",
                "--authfile",
                "/home/ci/.docker/config.json",
                "--no-tags",
                "docker://registry.local/app:main",
            ]
        );
    }

    /// Fake skopeo: lists `main` and `arm-only`, fails to inspect `arm-only`
    #[cfg(unix)]
    fn fake_skopeo(dir: &std::path::Path) -> RegistryOptions {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("skopeo");
        std::fs::write(
            &script,
            r#"#!/bin/sh
for last; do :; done
case "$1" in
  list-tags) echo '{"Tags": ["main", "arm-only"]}' ;;
  inspect)
    case "$last" in
      *:arm-only) echo "no image found in manifest list for architecture amd64" >&2; exit 1 ;;
      *) echo '{"Digest": "sha256:aaaa", "Created": "2024-01-15T10:00:00Z", "Labels": {}}' ;;
    esac ;;
  *) exit 2 ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        RegistryOptions {
            skopeo_bin: script.display().to_string(),
            ..RegistryOptions::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn one_uninspectable_tag_does_not_fail_listing() {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = SkopeoImagesRepo::new("registry.example.com/shop", &fake_skopeo(dir.path()));

        let listing = repo.list_tags("api").await.unwrap();

        assert_eq!(listing.tags.len(), 1);
        assert_eq!(listing.tags[0].tag, "main");
        assert_eq!(listing.tags[0].manifest_digest.as_deref(), Some("sha256:aaaa"));
        assert_eq!(listing.unreadable.len(), 1);
        assert_eq!(listing.unreadable[0].tag, "arm-only");
        assert!(listing.unreadable[0].reason.contains("architecture"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uninspectable_stage_fails_listing() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage =
            SkopeoStagesStorage::new("registry.example.com/shop-stages", &fake_skopeo(dir.path()));

        let err = storage.list_stages().await.unwrap_err();
        assert!(matches!(err, KeelError::StorageUnreachable { .. }));
    }

    #[test]
    fn stage_digest_falls_back_to_tag() {
        let stage = stage_from_labels(
            "deadbeef",
            "registry.local/stages:deadbeef".to_string(),
            &HashMap::from([(labels::STAGE_PARENT.to_string(), String::new())]),
            Utc::now(),
        );
        assert_eq!(stage.digest, "deadbeef");
        assert_eq!(stage.parent_digest, None);
    }
}
