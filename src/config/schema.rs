//! Configuration schema for keel
//!
//! Two files are read:
//! - the global config at `~/.config/keel/config.toml` (tooling settings)
//! - the project config `.keel.toml` (project name, images, policies)

use crate::cleanup::DEFAULT_WORKERS;
use crate::error::{KeelError, KeelResult};
use crate::policy::{CleanupPolicy, PolicyConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Root of the global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cleanup run settings
    pub cleanup: CleanupConfig,

    /// Cluster access
    pub kube: KubeConfig,

    /// Registry tooling
    pub registry: RegistryConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Record deletions in the audit log
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Cleanup run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Concurrent deletions per phase
    pub workers: usize,

    /// How long to wait for the project lock (0 = fail fast)
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            lock_wait: Duration::ZERO,
        }
    }
}

/// Cluster access settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubeConfig {
    /// kubectl binary
    pub kubectl_bin: String,

    /// Default kubeconfig path (overridden by --kube-config)
    pub kubeconfig: Option<PathBuf>,

    /// Default context (overridden by --kube-context)
    pub context: Option<String>,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            kubectl_bin: "kubectl".to_string(),
            kubeconfig: None,
            context: None,
        }
    }
}

/// Registry tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// skopeo binary used for remote repositories
    pub skopeo_bin: String,

    /// podman binary used for `:local` stages storage
    pub podman_bin: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            skopeo_bin: "skopeo".to_string(),
            podman_bin: "podman".to_string(),
        }
    }
}

/// Project config (`.keel.toml`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub project: ProjectSection,

    #[serde(default)]
    pub cleanup: ProjectCleanup,
}

/// `[project]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Project name; also names the project lock
    pub name: String,

    /// Images built by the project (an empty name is the nameless image)
    #[serde(default)]
    pub images: Vec<String>,
}

/// `[cleanup]` section of the project config
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectCleanup {
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl ProjectConfig {
    /// Parse and validate project config text
    pub fn parse(content: &str, path: &Path) -> KeelResult<Self> {
        let invalid = |reason: String| KeelError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let mut config: Self = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;

        let name = &config.project.name;
        if name.trim().is_empty() {
            return Err(invalid("project.name must not be empty".to_string()));
        }
        if !is_valid_project_name(name) {
            return Err(invalid(format!(
                "project.name '{}' may only contain letters, digits, '-', '_' and '.', and must not start with '.'",
                name
            )));
        }
        if config.project.images.is_empty() {
            return Err(invalid("project.images must list at least one image".to_string()));
        }

        let mut seen = HashSet::new();
        config.project.images.retain(|image| {
            let first = seen.insert(image.clone());
            if !first {
                warn!("Image '{}' listed twice in {}", image, path.display());
            }
            first
        });
        Ok(config)
    }

    /// Policies configured for the project, if any
    pub fn policies(&self) -> KeelResult<Option<Vec<CleanupPolicy>>> {
        if self.cleanup.policies.is_empty() {
            return Ok(None);
        }
        self.cleanup
            .policies
            .iter()
            .map(CleanupPolicy::try_from)
            .collect::<KeelResult<Vec<_>>>()
            .map(Some)
    }
}

/// Project names become lock file names
fn is_valid_project_name(name: &str) -> bool {
    !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TagScheme;

    #[test]
    fn global_defaults() {
        let config = Config::default();
        assert_eq!(config.general.log_format, "text");
        assert!(config.general.audit_log);
        assert_eq!(config.cleanup.workers, 8);
        assert_eq!(config.cleanup.lock_wait, Duration::ZERO);
        assert_eq!(config.kube.kubectl_bin, "kubectl");
    }

    #[test]
    fn global_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [cleanup]
            lock_wait = "2m"
            "#,
        )
        .unwrap();
        assert_eq!(config.cleanup.lock_wait, Duration::from_secs(120));
        assert_eq!(config.cleanup.workers, 8);
        assert_eq!(config.registry.skopeo_bin, "skopeo");
    }

    #[test]
    fn project_config_parses() {
        let config = ProjectConfig::parse(
            r#"
            [project]
            name = "shop"
            images = ["backend", "frontend"]

            [[cleanup.policies]]
            scheme = "git-tag"
            pattern = "v*"
            keep_last = 5
            "#,
            Path::new(".keel.toml"),
        )
        .unwrap();

        assert_eq!(config.project.name, "shop");
        assert_eq!(config.project.images, vec!["backend", "frontend"]);
        let policies = config.policies().unwrap().unwrap();
        assert_eq!(policies[0].scheme, TagScheme::GitTag);
        assert_eq!(policies[0].keep_last, Some(5));
    }

    #[test]
    fn project_without_policies() {
        let config = ProjectConfig::parse(
            "[project]\nname = \"shop\"\nimages = [\"\"]\n",
            Path::new(".keel.toml"),
        )
        .unwrap();
        assert!(config.policies().unwrap().is_none());
    }

    #[test]
    fn project_requires_name_and_images() {
        let path = Path::new(".keel.toml");
        assert!(ProjectConfig::parse("[project]\nname = \"\"\nimages = [\"a\"]\n", path).is_err());
        assert!(ProjectConfig::parse("[project]\nname = \"shop\"\n", path).is_err());
        assert!(ProjectConfig::parse("images = []", path).is_err());
    }

    #[test]
    fn project_name_must_be_a_file_name() {
        let path = Path::new(".keel.toml");
        for name in ["team/shop", "..", ".hidden", "shop lab"] {
            let content = format!("[project]\nname = \"{name}\"\nimages = [\"a\"]\n");
            let err = ProjectConfig::parse(&content, path).unwrap_err();
            assert!(err.to_string().contains("project.name"), "{name}");
        }
        assert!(ProjectConfig::parse("[project]\nname = \"shop-2.x_y\"\nimages = [\"a\"]\n", path).is_ok());
    }

    #[test]
    fn duplicate_images_are_dropped() {
        let config = ProjectConfig::parse(
            "[project]\nname = \"shop\"\nimages = [\"api\", \"web\", \"api\"]\n",
            Path::new(".keel.toml"),
        )
        .unwrap();
        assert_eq!(config.project.images, vec!["api", "web"]);
    }
}
