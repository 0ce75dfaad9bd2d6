use std::path::PathBuf;
use thiserror::Error;

use crate::cache::CacheError;

/// Errors raised by the watch/build/deploy core
#[derive(Debug, Error)]
pub enum SamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Fingerprint cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("No samconfig.toml found in {0:?}")]
    MissingConfigFile(PathBuf),

    #[error("Could not find or construct stack name (set stack_name, or base_stack and environment)")]
    UnresolvedStackName,

    #[error("No tsconfig.json found for {0:?} or any parent directory")]
    MissingCompilerConfig(PathBuf),

    #[error("External library {name} must declare compilerOptions.outDir in {tsconfig:?}")]
    ExternalLibraryWithoutOutDir { name: String, tsconfig: PathBuf },

    #[error("Invalid template {path:?}: {message}")]
    InvalidTemplate { path: PathBuf, message: String },

    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("Cloud call {operation} failed: {message}")]
    Cloud { operation: String, message: String },

    #[error("No deployed function found for logical id {0}")]
    FunctionNotDeployed(String),
}

pub type Result<T> = std::result::Result<T, SamError>;

impl SamError {
    pub fn invalid_template(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SamError::InvalidTemplate {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        SamError::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn cloud(operation: impl Into<String>, message: impl Into<String>) -> Self {
        SamError::Cloud {
            operation: operation.into(),
            message: message.into(),
        }
    }
}
