use crate::cache::FingerprintCache;
use crate::cloud::{AwsCliClient, CloudClient};
use crate::config::SamConfig;
use crate::toolchain::{ProcessToolchain, Toolchain};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Build tree consumed by the deploy tool, relative to the project root
pub const BUILD_ROOT_DIR: &str = ".build/root";

/// Scratch space for packaged artifacts, relative to the project root
pub const TEMP_DIR: &str = ".build/tmp";

/// Dependency injection container
/// Holds the project layout and every shared collaborator; each entity
/// receives it by `Arc` instead of reaching for global state.
pub struct Container {
    root: PathBuf,
    build_root: PathBuf,
    temp_dir: PathBuf,
    config: Arc<SamConfig>,
    fingerprints: Arc<FingerprintCache>,
    toolchain: Arc<dyn Toolchain>,
    cloud: Arc<dyn CloudClient>,
}

impl Container {
    /// Create a container with production dependencies
    pub fn new(root: &Path, config: SamConfig) -> Self {
        let cloud = Arc::new(AwsCliClient::new(config.region().map(str::to_string)));
        Self::with_dependencies(root, config, Arc::new(ProcessToolchain::new()), cloud)
    }

    /// Create a container with custom collaborators (for testing)
    pub fn with_dependencies(
        root: &Path,
        config: SamConfig,
        toolchain: Arc<dyn Toolchain>,
        cloud: Arc<dyn CloudClient>,
    ) -> Self {
        Container {
            root: root.to_path_buf(),
            build_root: root.join(BUILD_ROOT_DIR),
            temp_dir: root.join(TEMP_DIR),
            config: Arc::new(config),
            fingerprints: Arc::new(FingerprintCache::new(root)),
            toolchain,
            cloud,
        }
    }

    /// Absolute project root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute build root
    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn config(&self) -> &Arc<SamConfig> {
        &self.config
    }

    pub fn fingerprints(&self) -> &Arc<FingerprintCache> {
        &self.fingerprints
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    pub fn cloud(&self) -> &Arc<dyn CloudClient> {
        &self.cloud
    }

    /// Absolute path of a project-relative path
    pub fn source_path(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Absolute build-root mirror of a project-relative path
    pub fn mirror_path(&self, relative: &Path) -> PathBuf {
        self.build_root.join(relative)
    }

    /// Create the build root, cache and temp directories
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.build_root)?;
        std::fs::create_dir_all(&self.temp_dir)?;
        std::fs::create_dir_all(self.fingerprints.cache_dir())?;
        Ok(())
    }
}
