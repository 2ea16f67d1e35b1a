// ABOUTME: Configuration loading and validation for the parley storage engine.
// ABOUTME: Reads PARLEY_* environment variables and falls back to sensible defaults.

use std::path::{Path, PathBuf};

use parley_core::Project;
use thiserror::Error;

/// Default index filename under the storage root.
pub const DEFAULT_INDEX_FILE: &str = "parley.db";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PARLEY_INDEX_FILE must be a bare file name, got {0:?}")]
    InvalidIndexFile(String),

    #[error("PARLEY_PROJECT_PATH is empty")]
    EmptyProjectPath,

    #[error("could not determine the current directory: {0}")]
    CurrentDir(#[from] std::io::Error),
}

/// Storage configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub home: PathBuf,
    pub index_file: String,
    pub project_path: PathBuf,
    pub project_name: Option<String>,
}

impl StoreConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - PARLEY_HOME: storage root (default: ~/.parley)
    /// - PARLEY_INDEX_FILE: index file name under the root (default: parley.db)
    /// - PARLEY_PROJECT_PATH: project registered at startup (default: current directory)
    /// - PARLEY_PROJECT_NAME: display name for that project (default: its directory name)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("PARLEY_HOME")
            .ok()
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".parley")
            });

        let index_file = std::env::var("PARLEY_INDEX_FILE")
            .ok()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| DEFAULT_INDEX_FILE.to_string());

        let project_path = match std::env::var("PARLEY_PROJECT_PATH") {
            Ok(p) if p.trim().is_empty() => return Err(ConfigError::EmptyProjectPath),
            Ok(p) => PathBuf::from(p),
            Err(_) => std::env::current_dir()?,
        };

        let project_name = std::env::var("PARLEY_PROJECT_NAME")
            .ok()
            .filter(|n| !n.is_empty());

        let config = Self {
            home,
            index_file,
            project_path,
            project_name,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build a config rooted at `home` for the given project directory.
    pub fn new(home: impl Into<PathBuf>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            index_file: DEFAULT_INDEX_FILE.to_string(),
            project_path: project_path.into(),
            project_name: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = Path::new(&self.index_file);
        if name.components().count() != 1 || name.file_name().is_none() {
            return Err(ConfigError::InvalidIndexFile(self.index_file.clone()));
        }
        if self.project_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyProjectPath);
        }
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.home.join(&self.index_file)
    }

    /// The project registered when the engine initializes.
    pub fn project(&self) -> Project {
        match &self.project_name {
            Some(name) => Project::named(&self.project_path, name.clone()),
            None => Project::from_path(&self.project_path),
        }
    }
}
