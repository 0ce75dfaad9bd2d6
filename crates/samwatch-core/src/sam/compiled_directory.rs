//! One source directory's compile, install and package lifecycle

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::di::Container;
use crate::errors::{Result, SamError};
use crate::events::{Artifact, BuildComplete, Emitter};
use crate::manifest::{find_compiler_config_dir, CompilerConfigFile, PackageManifest};
use crate::paths::{
    copy_tree, in_modules_dir, is_manifest, normalize, path_smash, relative_to,
    COMPILER_CONFIG_FILE, LOCKFILE, MANIFEST_FILE, MODULES_DIR,
};
use crate::toolchain::{CompileRequest, InstallMode};

/// What a compiled directory is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryKind {
    /// Function code, compiled straight into the build root
    Function,
    /// Library consumed by layers; also emits declarations and is compiled
    /// in place before being copied
    SharedLibrary,
}

/// Result of a build request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The changed path is a build byproduct
    Ignored,
    /// Nothing changed since the last successful build
    UpToDate,
    Built,
}

pub struct CompiledDirectory {
    path: PathBuf,
    compiler_dir: PathBuf,
    out_dir: Option<PathBuf>,
    kind: DirectoryKind,
    ctx: Arc<Container>,
    installed: AtomicBool,
    retired: AtomicBool,
    build_complete: Emitter<BuildComplete>,
    packages: Emitter<Artifact>,
}

impl std::fmt::Debug for CompiledDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledDirectory")
            .field("path", &self.path)
            .field("compiler_dir", &self.compiler_dir)
            .field("out_dir", &self.out_dir)
            .field("kind", &self.kind)
            .finish()
    }
}

impl CompiledDirectory {
    /// Resolve the governing compiler configuration for a project-relative
    /// directory.
    ///
    /// Fails if no ancestor (up to the project root) holds one. A declared
    /// output directory gets the standard exclusions appended to the
    /// configuration.
    pub fn new(path: &Path, kind: DirectoryKind, ctx: Arc<Container>) -> Result<Self> {
        let path = normalize(path);
        info!("Tracking {:?} directory {:?}", kind, path);

        let compiler_dir = find_compiler_config_dir(ctx.root(), &path)
            .ok_or_else(|| SamError::MissingCompilerConfig(path.clone()))?;

        let mut config = CompilerConfigFile::load(&ctx.source_path(&compiler_dir))?;
        let out_dir = config.out_dir();
        if config.ensure_excludes()? {
            debug!("Added output exclusions to {:?}", compiler_dir.join(COMPILER_CONFIG_FILE));
        }

        Ok(Self {
            path,
            compiler_dir,
            out_dir,
            kind,
            ctx,
            installed: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            build_complete: Emitter::new(),
            packages: Emitter::new(),
        })
    }

    /// Project-relative source path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Project-relative directory of the governing compiler configuration
    pub fn compiler_dir(&self) -> &Path {
        &self.compiler_dir
    }

    pub fn out_dir(&self) -> Option<&Path> {
        self.out_dir.as_deref()
    }

    pub fn kind(&self) -> DirectoryKind {
        self.kind
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn build_complete(&self) -> &Emitter<BuildComplete> {
        &self.build_complete
    }

    pub fn packages(&self) -> &Emitter<Artifact> {
        &self.packages
    }

    /// Project-relative location of the compiled output
    fn output_path(&self) -> PathBuf {
        match &self.out_dir {
            Some(out_dir) => self.compiler_dir.join(out_dir),
            None => self.compiler_dir.clone(),
        }
    }

    /// Build-root mirror of this directory
    pub fn mirror(&self) -> PathBuf {
        self.ctx.mirror_path(&self.path)
    }

    fn output_present(&self) -> bool {
        self.ctx.mirror_path(&self.output_path()).exists()
            && (self.out_dir.is_some() || self.mirror().exists())
    }

    /// True for changes that only touch generated output or dependencies
    fn is_byproduct(&self, changed: &Path) -> bool {
        if in_modules_dir(changed) {
            return true;
        }
        let Some(out_dir) = &self.out_dir else {
            return false;
        };
        let local_out = self.compiler_dir.join(out_dir);
        relative_to(&self.path.join(changed), &local_out).is_some()
    }

    fn source_manifest(&self) -> Result<Option<PackageManifest>> {
        let file = self.ctx.source_path(&self.path).join(MANIFEST_FILE);
        if !file.exists() {
            return Ok(None);
        }
        Ok(Some(PackageManifest::load(&file)?))
    }

    /// Route a project-relative change inside this directory
    pub fn file_event(&self, changed: &Path) -> Result<BuildOutcome> {
        let is_temp_manifest = changed
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("package.json."));
        if is_temp_manifest || self.is_retired() {
            return Ok(BuildOutcome::Ignored);
        }

        debug!("File event {:?} in {:?}", changed, self.path);
        self.build(Some(changed), false)
    }

    /// Install source dependencies unless that already happened
    pub fn install_at_least_once(&self) -> Result<()> {
        if self.installed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.install_dependencies()
    }

    fn install_dependencies(&self) -> Result<()> {
        let has_dependencies = self
            .source_manifest()?
            .is_some_and(|manifest| manifest.has_dependencies());
        if has_dependencies {
            info!("Installing dependencies for {:?}", self.path);
            self.ctx.toolchain().install(
                &self.ctx.source_path(&self.path),
                InstallMode::Development,
            )?;
        }
        self.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Build without packaging if the compiled output was never produced
    pub fn build_if_not_present(&self) -> Result<BuildOutcome> {
        if self.output_present() {
            return Ok(BuildOutcome::UpToDate);
        }
        self.build(None, true)
    }

    /// Compile the directory into the build root.
    ///
    /// `changed` is the triggering path relative to this directory, or `None`
    /// for a full build. Only a triggered build packages, and only when
    /// `skip_package` is false. Build failures are logged and returned; the
    /// fingerprint stays stale so the next event retries.
    pub fn build(&self, changed: Option<&Path>, skip_package: bool) -> Result<BuildOutcome> {
        if changed.is_some_and(|changed| self.is_byproduct(changed)) {
            return Ok(BuildOutcome::Ignored);
        }

        let stale = self.ctx.fingerprints().is_stale(&self.path)?;
        if !stale && self.output_present() {
            debug!("{:?} is up to date", self.path);
            return Ok(BuildOutcome::UpToDate);
        }

        if let Err(e) = self.run_build(changed) {
            error!("Build of {:?} failed: {}", self.path, e);
            return Err(e);
        }

        self.ctx.fingerprints().mark_clean(&self.path)?;
        self.build_complete.emit(&BuildComplete);
        info!("Build complete {:?}", self.path);

        if let Some(changed) = changed {
            if !skip_package {
                self.package(changed);
            }
        }
        Ok(BuildOutcome::Built)
    }

    fn run_build(&self, changed: Option<&Path>) -> Result<()> {
        if let Some(changed) = changed {
            info!("File changed {:?}", self.path.join(changed));
        }

        let manifest_changed = changed.is_some_and(is_manifest);
        let never_installed = !self.installed.load(Ordering::SeqCst)
            && !self.ctx.source_path(&self.path).join(MODULES_DIR).exists();
        if manifest_changed || (changed.is_none() && never_installed) {
            self.install_dependencies()?;
        }

        match self.kind {
            DirectoryKind::Function => {
                self.sync_sources()?;
                self.compile()?;
            }
            DirectoryKind::SharedLibrary => {
                self.compile()?;
                self.sync_sources()?;
                self.copy_library_output()?;
            }
        }

        if changed.is_none() || manifest_changed {
            self.write_build_manifest()?;
        }
        Ok(())
    }

    /// Mirror non-compiled assets into the build root
    fn sync_sources(&self) -> Result<()> {
        let local_out = self
            .out_dir
            .as_ref()
            .and_then(|out| relative_to(&self.compiler_dir.join(out), &self.path));

        let copied = copy_tree(
            &self.ctx.source_path(&self.path),
            &self.mirror(),
            |relative, is_dir| {
                if is_dir {
                    return relative.file_name().map_or(true, |name| name != MODULES_DIR)
                        && local_out.as_deref() != Some(relative);
                }
                let name = relative.file_name().and_then(|n| n.to_str()).unwrap_or("");
                !(name.ends_with(".ts")
                    || name == MANIFEST_FILE
                    || name == LOCKFILE
                    || name == COMPILER_CONFIG_FILE)
            },
        )?;
        debug!("Copied {} asset(s) for {:?}", copied, self.path);
        Ok(())
    }

    fn compile(&self) -> Result<()> {
        let project_dir = self.ctx.source_path(&self.compiler_dir);
        let request = match self.kind {
            DirectoryKind::Function => CompileRequest {
                project_dir,
                out_dir: Some(self.ctx.mirror_path(&self.output_path())),
                declarations: false,
            },
            DirectoryKind::SharedLibrary => CompileRequest {
                project_dir,
                out_dir: None,
                declarations: true,
            },
        };
        info!("Compiling {:?}", self.path);
        self.ctx.toolchain().compile(&request)
    }

    /// Deep-copy a library's local output so dependents can resolve it
    fn copy_library_output(&self) -> Result<()> {
        if self.out_dir.is_none() {
            return Ok(());
        }
        let output = self.output_path();
        copy_tree(
            &self.ctx.source_path(&output),
            &self.ctx.mirror_path(&output),
            |_, _| true,
        )?;
        Ok(())
    }

    /// Write the manifest into the mirror with local references rebased onto
    /// their build-root mirrors, then install runtime dependencies there
    fn write_build_manifest(&self) -> Result<()> {
        let Some(mut manifest) = self.source_manifest()? else {
            return Ok(());
        };
        let mirror = self.mirror();
        manifest.rewrite_local(|_, reference| normalize(&mirror.join(reference)));
        manifest.save(&mirror.join(MANIFEST_FILE))?;

        if manifest.has_dependencies() {
            self.ctx
                .toolchain()
                .install(&mirror, InstallMode::Production)?;
        }
        Ok(())
    }

    /// Archive the build-root mirror and emit the bytes.
    ///
    /// Errors are logged and swallowed.
    pub fn package(&self, changed: &Path) -> Option<Artifact> {
        match self.try_package(changed) {
            Ok(artifact) => {
                info!("Packaging complete {:?}", self.path);
                self.packages.emit(&artifact);
                Some(artifact)
            }
            Err(e) => {
                error!("Packaging {:?} failed: {}", self.path, e);
                None
            }
        }
    }

    fn try_package(&self, changed: &Path) -> Result<Artifact> {
        let mirror = self.mirror();
        if is_manifest(changed) || !mirror.join(MODULES_DIR).exists() {
            let has_dependencies = self
                .source_manifest()?
                .is_some_and(|manifest| manifest.has_dependencies());
            if has_dependencies {
                info!("Updating dependencies for {:?}", self.path);
                self.ctx.toolchain().install(&mirror, InstallMode::Production)?;
            }
        }

        let zip = self.ctx.temp_dir().join(self.artifact_name());
        debug!("Archiving {:?} into {:?}", mirror, zip);
        self.ctx.toolchain().archive(&mirror, &zip)?;
        let bytes = std::fs::read(&zip)?;
        Ok(Artifact::from(bytes))
    }

    fn artifact_name(&self) -> String {
        let hash = blake3::hash(self.path.to_string_lossy().as_bytes());
        format!("{}-{}.zip", path_smash(&self.path), &hash.to_hex()[..12])
    }

    /// Stop reacting to events and detach every listener
    pub fn cleanup(&self) {
        if !self.retired.swap(true, Ordering::SeqCst) {
            debug!("Retiring compiled directory {:?}", self.path);
        }
        self.build_complete.clear();
        self.packages.clear();
    }
}
