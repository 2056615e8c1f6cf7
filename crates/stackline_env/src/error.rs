//! Error types for the environment crate.

use thiserror::Error;

use stackline_core::CoreError;

/// Result type alias for environment operations.
pub type EnvResult<T> = Result<T, EnvError>;

/// Errors that can occur while building or materializing the environment.
#[derive(Error, Debug)]
pub enum EnvError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid resource {logical_id}: {reason}")]
    InvalidResource { logical_id: String, reason: String },

    #[error("State file error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EnvError {
    /// Convert into a core error, e.g. to return from a backend call.
    pub fn into_core(self) -> CoreError {
        match self {
            EnvError::Core(e) => e,
            EnvError::Io(e) => CoreError::Io(e),
            other => CoreError::Serialization(other.to_string()),
        }
    }
}
