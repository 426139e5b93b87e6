//! Images repo and stages storage abstraction
//!
//! The cleanup core only lists and deletes; publishing happens during builds.
//! Backends are eventually consistent: a tag deleted a moment ago may still
//! show up in a later listing of the same run.
//!
//! | Backend | Implementation |
//! |---------|----------------|
//! | images repo | `skopeo` against a registry |
//! | stages storage `:local` | local `podman` images |
//! | stages storage `<repo>` | `skopeo`, one tag per stage digest |

mod factory;
mod podman;
mod skopeo;

pub use factory::{create_images_repo, create_stages_storage, RegistryOptions, StagesStorageRef};
pub use podman::{parse_podman_images, PodmanStagesStorage};
pub use skopeo::{SkopeoClient, SkopeoImagesRepo, SkopeoStagesStorage};

use crate::error::{KeelError, KeelResult};
use crate::policy::TagScheme;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Image label keys written at build time and read back during cleanup
pub mod labels {
    /// Project owning the image
    pub const PROJECT: &str = "keel.project";
    /// Digest of the stage (final stage for published images)
    pub const STAGE_DIGEST: &str = "keel.stage-digest";
    /// Digest of the parent stage
    pub const STAGE_PARENT: &str = "keel.stage-parent";
    /// Tagging scheme the image was published under
    pub const TAG_SCHEME: &str = "keel.tag-scheme";
    /// Git branch, tag or commit the tag was derived from
    pub const GIT_REF: &str = "keel.git-ref";
}

/// A published tag in the images repo
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageTag {
    pub image_name: String,
    pub tag: String,
    pub scheme: TagScheme,
    /// Git reference embedded in the tag (none for custom tags)
    pub git_ref: Option<String>,
    pub final_stage_digest: String,
    pub created_at: DateTime<Utc>,
    /// Registry manifest digest; tags sharing it are deleted together
    pub manifest_digest: Option<String>,
}

impl ImageTag {
    /// Build from image labels; unlabelled tags are treated as custom
    pub fn from_labels(
        image_name: &str,
        tag: &str,
        labels: &HashMap<String, String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let scheme = labels
            .get(labels::TAG_SCHEME)
            .and_then(|s| TagScheme::from_label(s))
            .unwrap_or(TagScheme::Custom);

        let git_ref = if scheme.is_git() {
            labels
                .get(labels::GIT_REF)
                .cloned()
                .or_else(|| Some(tag.to_string()))
        } else {
            None
        };

        Self {
            image_name: image_name.to_string(),
            tag: tag.to_string(),
            scheme,
            git_ref,
            final_stage_digest: labels
                .get(labels::STAGE_DIGEST)
                .cloned()
                .unwrap_or_default(),
            created_at,
            manifest_digest: None,
        }
    }

    pub fn with_manifest_digest(mut self, digest: Option<String>) -> Self {
        self.manifest_digest = digest.filter(|d| !d.is_empty());
        self
    }

    /// What policy patterns match against: the git reference, or the tag
    /// itself for custom tags
    pub fn subject(&self) -> &str {
        self.git_ref.as_deref().unwrap_or(&self.tag)
    }

    /// Whether both tags were published from the same reference of one image
    pub fn same_reference(&self, other: &ImageTag) -> bool {
        self.image_name == other.image_name
            && self.scheme == other.scheme
            && self.git_ref == other.git_ref
    }

    /// Repository path of this tag's image inside `repo`
    pub fn repository(&self, repo: &str) -> String {
        image_repository(repo, &self.image_name)
    }

    /// Fully-qualified image reference, as workloads refer to it
    pub fn reference(&self, repo: &str) -> String {
        format!("{}:{}", self.repository(repo), self.tag)
    }

    /// `repository@digest`, for workloads that pin the manifest
    pub fn digest_reference(&self, repo: &str) -> Option<String> {
        self.manifest_digest
            .as_ref()
            .map(|digest| format!("{}@{}", self.repository(repo), digest))
    }
}

/// Repository path of `image_name` inside `repo`; the nameless image lives
/// at `repo` itself
pub fn image_repository(repo: &str, image_name: &str) -> String {
    if image_name.is_empty() {
        repo.to_string()
    } else {
        format!("{}/{}", repo, image_name)
    }
}

/// Keep the missing-CLI error (it carries a hint and halts the run);
/// anything else becomes the backend-specific error built by `wrap`
pub(crate) fn backend_error(err: KeelError, wrap: impl FnOnce(String) -> KeelError) -> KeelError {
    match err {
        e @ KeelError::CliNotFound { .. } => e,
        other => wrap(other.to_string()),
    }
}

/// A listed tag whose metadata could not be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableTag {
    pub image_name: String,
    pub tag: String,
    pub reason: String,
}

impl UnreadableTag {
    pub fn reference(&self, repo: &str) -> String {
        format!("{}:{}", image_repository(repo, &self.image_name), self.tag)
    }
}

/// Tags of one image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagListing {
    pub tags: Vec<ImageTag>,
    /// Listed but not inspectable; neither kept nor deleted by policy
    pub unreadable: Vec<UnreadableTag>,
}

impl From<Vec<ImageTag>> for TagListing {
    fn from(tags: Vec<ImageTag>) -> Self {
        Self {
            tags,
            unreadable: Vec::new(),
        }
    }
}

/// A cached build stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub digest: String,
    pub parent_digest: Option<String>,
    /// Backend-specific address (image id or reference)
    pub location: String,
    pub created_at: DateTime<Utc>,
}

impl Stage {
    /// Content digest of a stage: parent digest, build instructions and the
    /// git commit they were built from
    pub fn compute_digest(parent: Option<&str>, instructions: &str, commit: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        for part in [parent.unwrap_or(""), instructions, commit.unwrap_or("")] {
            hasher.update(part.len().to_le_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Registry holding published image tags
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Repository address images are published under
    fn address(&self) -> &str;

    /// List all tags of one image. Fails only when the repository itself
    /// cannot be listed.
    async fn list_tags(&self, image_name: &str) -> KeelResult<TagListing>;

    /// Delete a single tag
    async fn delete_tag(&self, tag: &ImageTag) -> KeelResult<()>;
}

/// Backend holding cached build stages
#[async_trait]
pub trait StageStorage: Send + Sync {
    /// Human-readable address for reports
    fn address(&self) -> &str;

    /// List every stage of the project
    async fn list_stages(&self) -> KeelResult<Vec<Stage>>;

    /// Delete a single stage
    async fn delete_stage(&self, stage: &Stage) -> KeelResult<()>;
}
