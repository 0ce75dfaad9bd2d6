use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to walk {path:?}: {message}")]
    Walk { path: PathBuf, message: String },

    #[error("Tracked path not found: {path:?}")]
    PathNotFound { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, CacheError>;
