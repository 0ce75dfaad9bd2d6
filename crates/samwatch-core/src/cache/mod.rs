//! Modification fingerprint cache for tracked directories
//!
//! This module answers "has this directory changed since its last
//! successful build?" by comparing the most recent modification time under
//! the directory against a remembered fingerprint. Fingerprints are kept in
//! memory and persisted to one small file per tracked path so that a restart
//! does not force every directory to rebuild.

mod error;
mod fingerprint;
mod manager;

pub use error::{CacheError, Result};
pub use fingerprint::{fingerprint_dir, format_fingerprint, latest_modified};
pub use manager::FingerprintCache;

/// Default cache directory, relative to the project root
pub const CACHE_DIR_NAME: &str = ".build/hash";

/// Subfolders never considered when fingerprinting (generated artifacts)
pub const IGNORED_DIRS: &[&str] = &["dist", crate::paths::MODULES_DIR];
