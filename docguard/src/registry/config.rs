use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where the registry connects and where it finds definition files.
///
/// ```yaml
/// connection: sqlite://data/app.db
/// model_directory: models
/// provision: true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub connection: String,
    #[serde(alias = "modelDirectory")]
    pub model_directory: PathBuf,
    /// Set to false for environments that are already provisioned.
    #[serde(default = "default_provision")]
    pub provision: bool,
}

fn default_provision() -> bool {
    true
}

impl LoaderConfig {
    pub fn new(connection: impl Into<String>, model_directory: impl Into<PathBuf>) -> Self {
        LoaderConfig {
            connection: connection.into(),
            model_directory: model_directory.into(),
            provision: true,
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read a config file. A relative `model_directory` resolves against
    /// the file's own directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        if config.model_directory.is_relative() {
            if let Some(parent) = path.parent() {
                config.model_directory = parent.join(&config.model_directory);
            }
        }
        Ok(config)
    }
}
