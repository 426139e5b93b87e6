//! Backend factory for images repos and stages storages

use super::podman::PodmanStagesStorage;
use super::skopeo::{SkopeoImagesRepo, SkopeoStagesStorage};
use super::{ImageRegistry, StageStorage};
use crate::config::schema::RegistryConfig;
use crate::error::KeelError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Connection options shared by every registry backend
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Directory holding a docker `config.json` with registry credentials
    pub docker_config: Option<PathBuf>,
    /// Allow plain HTTP / unverified TLS
    pub insecure: bool,
    pub skopeo_bin: String,
    pub podman_bin: String,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}

impl RegistryOptions {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            docker_config: None,
            insecure: false,
            skopeo_bin: config.skopeo_bin.clone(),
            podman_bin: config.podman_bin.clone(),
        }
    }
}

/// Where stages are stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagesStorageRef {
    /// Local podman images
    Local,
    /// A registry repository
    Repo(String),
}

impl FromStr for StagesStorageRef {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            ":local" => Ok(Self::Local),
            "" => Err(KeelError::ConfigInvalid {
                path: PathBuf::from("--stages-storage"),
                reason: "stages storage must be :local or a repository address".to_string(),
            }),
            repo => Ok(Self::Repo(repo.trim_end_matches('/').to_string())),
        }
    }
}

impl fmt::Display for StagesStorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, ":local"),
            Self::Repo(repo) => write!(f, "{}", repo),
        }
    }
}

/// Create the images repo backend
pub fn create_images_repo(repo: &str, options: &RegistryOptions) -> Box<dyn ImageRegistry> {
    Box::new(SkopeoImagesRepo::new(repo.trim_end_matches('/'), options))
}

/// Create the stages storage backend for a project
pub fn create_stages_storage(
    storage: &StagesStorageRef,
    project: &str,
    options: &RegistryOptions,
) -> Box<dyn StageStorage> {
    match storage {
        StagesStorageRef::Local => Box::new(PodmanStagesStorage::new(project, options)),
        StagesStorageRef::Repo(repo) => Box::new(SkopeoStagesStorage::new(repo.clone(), options)),
    }
}
