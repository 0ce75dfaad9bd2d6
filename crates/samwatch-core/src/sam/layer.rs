//! Shared dependency layers and the libraries they build

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::compiled_directory::{CompiledDirectory, DirectoryKind};
use super::resource::LayerDecl;
use crate::di::Container;
use crate::errors::{Result, SamError};
use crate::events::{Emitter, LayerChange, ListenerId};
use crate::manifest::{CompilerConfigFile, Lockfile, PackageManifest, FILE_PREFIX};
use crate::paths::{diff_paths, normalize, relative_to, LOCKFILE, MANIFEST_FILE};
use crate::toolchain::InstallMode;

/// Folder holding the package inside a layer's content, unless the layer is
/// built by the deploy tool's own node builder
pub const DEFAULT_PACKAGE_FOLDER: &str = "nodejs";

/// Build-root folder holding links to libraries outside the project
pub const EXTERNALS_DIR: &str = "externals";

/// A local (`file:`) dependency, resolved against the project
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalDependency {
    /// Inside the project; tracked as a shared library (project-relative)
    InRepo { name: String, path: PathBuf },
    /// Outside the project; linked under the externals area (absolute)
    External { name: String, path: PathBuf },
}

impl LocalDependency {
    pub fn name(&self) -> &str {
        match self {
            LocalDependency::InRepo { name, .. } | LocalDependency::External { name, .. } => name,
        }
    }
}

/// Split a manifest's local dependencies into in-repo libraries and
/// external ones. Registry dependencies are not returned.
///
/// `manifest_dir` is the absolute directory holding the manifest and `root`
/// the absolute project root.
pub fn classify_dependencies(
    manifest: &PackageManifest,
    manifest_dir: &Path,
    root: &Path,
) -> Vec<LocalDependency> {
    manifest
        .local_dependencies()
        .map(|(name, reference)| {
            let resolved = normalize(&manifest_dir.join(reference));
            match relative_to(&resolved, root) {
                Some(path) => LocalDependency::InRepo {
                    name: name.to_string(),
                    path,
                },
                None => LocalDependency::External {
                    name: name.to_string(),
                    path: resolved,
                },
            }
        })
        .collect()
}

struct LibBinding {
    directory: Arc<CompiledDirectory>,
    listener: ListenerId,
}

struct LayerState {
    path: PathBuf,
    layer_name: String,
    package_folder: PathBuf,
    libs: Vec<LibBinding>,
}

/// A deployable layer package
pub struct LayerEntity {
    name: String,
    stack_name: String,
    ctx: Arc<Container>,
    state: Mutex<LayerState>,
    layer_change: Arc<Emitter<LayerChange>>,
}

impl LayerEntity {
    /// Create the layer and reconcile its manifest once
    pub fn new(
        name: &str,
        decl: &LayerDecl,
        stack_name: &str,
        ctx: Arc<Container>,
    ) -> Result<Self> {
        let layer = Self {
            name: name.to_string(),
            stack_name: stack_name.to_string(),
            ctx,
            state: Mutex::new(LayerState {
                path: PathBuf::new(),
                layer_name: String::new(),
                package_folder: PathBuf::new(),
                libs: Vec::new(),
            }),
            layer_change: Arc::new(Emitter::new()),
        };
        layer.set_config(decl);
        info!("Identified layer {} at {:?}", layer.name, layer.path());

        let manifest_path = layer.manifest_path();
        layer.file_event(&manifest_path)?;
        Ok(layer)
    }

    /// Apply a (possibly changed) declaration from a template reload
    pub fn set_config(&self, decl: &LayerDecl) {
        let package_folder = match &decl.build_method {
            Some(method) if method.starts_with("nodejs") => PathBuf::new(),
            _ => PathBuf::from(DEFAULT_PACKAGE_FOLDER),
        };
        let mut state = self.lock();
        state.path = normalize(&decl.content_uri);
        state.layer_name = decl
            .layer_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.stack_name, self.name));
        state.package_folder = package_folder;
    }

    /// Logical resource name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Project-relative content path
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Deployed layer name
    pub fn layer_name(&self) -> String {
        self.lock().layer_name.clone()
    }

    /// Package folder relative to the content path (empty for the content root)
    pub fn package_folder(&self) -> PathBuf {
        self.lock().package_folder.clone()
    }

    /// Manifest path relative to the content path
    pub fn manifest_path(&self) -> PathBuf {
        self.lock().package_folder.join(MANIFEST_FILE)
    }

    /// Compiled libraries currently owned by the layer
    pub fn libs(&self) -> Vec<Arc<CompiledDirectory>> {
        self.lock()
            .libs
            .iter()
            .map(|binding| Arc::clone(&binding.directory))
            .collect()
    }

    pub fn layer_change(&self) -> &Emitter<LayerChange> {
        &self.layer_change
    }

    /// React to a change relative to the content path. Only the manifest
    /// matters here; library sources are routed to the libraries directly.
    pub fn file_event(&self, changed: &Path) -> Result<()> {
        if normalize(changed) != self.manifest_path() {
            return Ok(());
        }
        self.reconcile_manifest().inspect_err(|e| {
            error!("Layer {} failed to reconcile its manifest: {}", self.name, e);
        })
    }

    fn reconcile_manifest(&self) -> Result<()> {
        let (path, package_folder) = {
            let state = self.lock();
            (state.path.clone(), state.package_folder.clone())
        };
        let root = self.ctx.root();
        let package_dir = normalize(&root.join(&path).join(&package_folder));
        let manifest_file = package_dir.join(MANIFEST_FILE);
        if !manifest_file.exists() {
            info!("{:?} does not exist, layer {} has no dependencies yet", manifest_file, self.name);
            return Ok(());
        }

        let mut manifest = PackageManifest::load(&manifest_file)?;
        let lockfile_path = package_dir.join(LOCKFILE);
        let mut lockfile = if lockfile_path.exists() {
            Some(Lockfile::load(&lockfile_path)?)
        } else {
            None
        };

        if self.ctx.config().stack_reference_layer() == Some(self.name.as_str()) {
            self.merge_root_dependencies(&mut manifest, &package_dir)?;
            // The captured lockfile no longer matches the merged dependency set
            lockfile = None;
        }

        let build_dir = self.ctx.mirror_path(&path.join(&package_folder));
        std::fs::create_dir_all(&build_dir)?;

        let dependencies = classify_dependencies(&manifest, &package_dir, root);
        let mut rebased = Vec::with_capacity(dependencies.len());
        let mut lib_paths = Vec::new();
        for dependency in &dependencies {
            let target = match dependency {
                LocalDependency::InRepo { path, .. } => {
                    lib_paths.push(path.clone());
                    self.ctx.mirror_path(path)
                }
                LocalDependency::External { name, path } => self.link_external(name, path)?,
            };
            rebased.push((dependency.name().to_string(), target));
        }

        self.sync_libs(&lib_paths)?;

        manifest.rewrite_local(|name, reference| {
            rebased
                .iter()
                .find(|(dependency, _)| dependency == name)
                .map(|(_, target)| target.clone())
                .unwrap_or_else(|| reference.to_path_buf())
        });
        if let Some(lockfile) = lockfile.as_mut() {
            for (name, target) in &rebased {
                lockfile.patch_local(name, &format!("{}{}", FILE_PREFIX, target.display()));
            }
        }

        info!("Constructing build directory for layer {}", self.name);
        manifest.save(&build_dir.join(MANIFEST_FILE))?;
        let build_lockfile = build_dir.join(LOCKFILE);
        match &lockfile {
            Some(lockfile) => lockfile.save(&build_lockfile)?,
            None if build_lockfile.exists() => std::fs::remove_file(&build_lockfile)?,
            None => {}
        }

        if manifest.has_dependencies() {
            let mode = if lockfile.is_some() {
                InstallMode::Reproducible
            } else {
                InstallMode::Production
            };
            info!("Installing dependencies for layer {}", self.name);
            self.ctx.toolchain().install(&build_dir, mode)?;
        }

        self.layer_change.emit(&LayerChange {
            layer: self.name.clone(),
        });
        Ok(())
    }

    /// Fold the project root's dependencies into this layer's manifest
    fn merge_root_dependencies(
        &self,
        manifest: &mut PackageManifest,
        package_dir: &Path,
    ) -> Result<()> {
        let root = self.ctx.root();
        let root_manifest_file = root.join(MANIFEST_FILE);
        if !root_manifest_file.exists() {
            warn!("Stack reference layer {} found no root {}", self.name, MANIFEST_FILE);
            return Ok(());
        }
        info!("Constructing combined dependencies for layer {}", self.name);

        let root_manifest = PackageManifest::load(&root_manifest_file)?;
        for (name, spec) in root_manifest.dependencies {
            let spec = match spec.strip_prefix(FILE_PREFIX) {
                Some(reference) => {
                    let rebased = diff_paths(&root.join(reference), package_dir);
                    format!("{}{}", FILE_PREFIX, rebased.display())
                }
                None => spec,
            };
            manifest.dependencies.insert(name, spec);
        }
        Ok(())
    }

    /// Link an out-of-project library under the externals area so the
    /// package manager sees a normalized local reference
    fn link_external(&self, name: &str, source: &Path) -> Result<PathBuf> {
        let link_dir = self.ctx.build_root().join(EXTERNALS_DIR).join(name);
        std::fs::create_dir_all(&link_dir)?;
        if link_dir.join(MANIFEST_FILE).exists() {
            return Ok(link_dir);
        }

        info!("Creating local link to external library {:?}", source);
        let out_dir = CompilerConfigFile::load(source)?
            .out_dir()
            .ok_or_else(|| SamError::ExternalLibraryWithoutOutDir {
                name: name.to_string(),
                tsconfig: source.join(crate::paths::COMPILER_CONFIG_FILE),
            })?;

        symlink(&source.join(MANIFEST_FILE), &link_dir.join(MANIFEST_FILE), false)?;
        let linked_out = link_dir.join(&out_dir);
        if let Some(parent) = linked_out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        symlink(&source.join(&out_dir), &linked_out, true)?;
        Ok(link_dir)
    }

    /// Keep one compiled library per referenced path, reusing existing ones
    fn sync_libs(&self, wanted: &[PathBuf]) -> Result<()> {
        let mut current = std::mem::take(&mut self.lock().libs);

        let (kept, dropped): (Vec<_>, Vec<_>) = current
            .drain(..)
            .partition(|binding| wanted.iter().any(|path| path == binding.directory.path()));
        for binding in dropped {
            debug!("Layer {} no longer uses {:?}", self.name, binding.directory.path());
            binding.directory.build_complete().unsubscribe(binding.listener);
            binding.directory.cleanup();
        }

        let mut libs = kept;
        for path in wanted {
            if libs.iter().any(|binding| binding.directory.path() == path) {
                continue;
            }
            let directory = Arc::new(CompiledDirectory::new(
                path,
                DirectoryKind::SharedLibrary,
                Arc::clone(&self.ctx),
            )?);
            directory.build_if_not_present()?;

            let emitter = Arc::clone(&self.layer_change);
            let layer = self.name.clone();
            let listener = directory.build_complete().subscribe(move |_| {
                emitter.emit(&LayerChange {
                    layer: layer.clone(),
                });
            });
            libs.push(LibBinding {
                directory,
                listener,
            });
        }

        self.lock().libs = libs;
        Ok(())
    }

    /// Release every owned library and detach all listeners
    pub fn cleanup(&self) {
        let libs = std::mem::take(&mut self.lock().libs);
        for binding in libs {
            binding.directory.build_complete().unsubscribe(binding.listener);
            binding.directory.cleanup();
        }
        self.layer_change.clear();
        debug!("Layer {} cleaned up", self.name);
    }

    fn lock(&self) -> MutexGuard<'_, LayerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(unix)]
fn symlink(source: &Path, link: &Path, _is_dir: bool) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, link)
}

#[cfg(windows)]
fn symlink(source: &Path, link: &Path, is_dir: bool) -> std::io::Result<()> {
    if is_dir {
        std::os::windows::fs::symlink_dir(source, link)
    } else {
        std::os::windows::fs::symlink_file(source, link)
    }
}
