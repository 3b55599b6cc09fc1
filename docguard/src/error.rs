use crate::storage::StorageError;
use crate::validation::ValidationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocGuardError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Unable to $unset required key '{field}'")]
    ProtectedField { field: String },

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("{0}")]
    InvalidOptions(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Collection '{0}' is not registered")]
    UnknownCollection(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DocGuardError>;
