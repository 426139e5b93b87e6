//! Configuration management for keel

pub mod schema;

pub use schema::{Config, ProjectConfig};

use crate::error::{KeelError, KeelResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Project config file name, discovered upward from the project directory
pub const PROJECT_CONFIG_FILE: &str = ".keel.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keel")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keel")
    }

    /// Directory holding project lock files
    pub fn locks_dir() -> PathBuf {
        Self::state_dir().join("locks")
    }

    /// Get the audit log path
    pub fn audit_log_path() -> PathBuf {
        Self::state_dir().join("audit.log")
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> KeelResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&self.config_path).await.map_err(|e| {
            KeelError::io(format!("reading config from {}", self.config_path.display()), e)
        })?;

        toml::from_str(&content).map_err(|e| KeelError::ConfigInvalid {
            path: self.config_path.clone(),
            reason: e.to_string(),
        })
    }

    /// Find `.keel.toml` in `start` or any of its ancestors
    pub fn find_project_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(PROJECT_CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Locate and load the project config for a project directory
    pub async fn load_project(project_dir: &Path) -> KeelResult<(PathBuf, ProjectConfig)> {
        let path = Self::find_project_config(project_dir)
            .ok_or_else(|| KeelError::ProjectConfigNotFound(project_dir.to_path_buf()))?;
        debug!("Found project config: {}", path.display());

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| KeelError::io(format!("reading project config {}", path.display()), e))?;

        let config = ProjectConfig::parse(&content, &path)?;
        Ok((path, config))
    }

    /// Ensure all state directories exist
    pub async fn ensure_state_dirs() -> KeelResult<()> {
        for dir in [Self::state_dir(), Self::locks_dir()] {
            fs::create_dir_all(&dir).await.map_err(|e| KeelError::ConfigDirCreate {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::with_path(temp.path().join("nonexistent.toml"));

        let config = manager.load().await.unwrap();
        assert_eq!(config.general.log_format, "text");
    }

    #[tokio::test]
    async fn load_invalid_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[cleanup]\nworkers = \"many\"\n").unwrap();

        let err = ConfigManager::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, KeelError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn project_config_found_in_ancestor() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(PROJECT_CONFIG_FILE),
            "[project]\nname = \"shop\"\nimages = [\"api\"]\n",
        )
        .unwrap();
        let nested = temp.path().join("services").join("api");
        std::fs::create_dir_all(&nested).unwrap();

        let (path, config) = ConfigManager::load_project(&nested).await.unwrap();
        assert_eq!(path, temp.path().join(PROJECT_CONFIG_FILE));
        assert_eq!(config.project.name, "shop");
    }

    #[tokio::test]
    async fn project_config_missing() {
        let temp = TempDir::new().unwrap();
        let err = ConfigManager::load_project(temp.path()).await.unwrap_err();
        assert!(matches!(err, KeelError::ProjectConfigNotFound(_)));
    }
}
