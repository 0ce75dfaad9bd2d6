//! Template reconciliation
//!
//! A [`TemplateReconciler`] owns the live object graph behind one template:
//! layers, functions, the compiled directories they build from and any
//! nested stacks. Every [`TemplateReconciler::reload`] re-parses the template
//! and diffs the graph in place, reusing entities by logical name and
//! compiled directories by path, so listeners stay registered across reloads.
//!
//! File events are routed by component-wise path prefix to whichever owner
//! contains the changed path.

use indexmap::IndexMap;
use rayon::prelude::*;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::compiled_directory::{CompiledDirectory, DirectoryKind};
use super::function::FunctionEntity;
use super::layer::LayerEntity;
use super::parameters::{build_overlays, promote_child_parameters, resolve_layer_parameters};
use super::postprocess::{
    add_api_permissions, add_marker_tag, apply_config_defaults, merge_global_policies,
    substitute_parameter_defaults,
};
use super::resource::{classify_resources, global_code_uri, LayerDecl, Resource};
use crate::cloud::StackResource;
use crate::config::CONFIG_FILE_NAME;
use crate::di::Container;
use crate::errors::{Result, SamError};
use crate::events::{Emitter, LayerChange, ListenerId, TemplateUpdate};
use crate::paths::{normalize, relative_to};

/// Where a reload currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReloadPhase {
    #[default]
    Idle,
    Parsing,
    DiffingLayers,
    DiffingFunctions,
    DiffingSubstacks,
    ParameterResolution,
    WritingOutput,
}

struct LayerBinding {
    layer: Arc<LayerEntity>,
    listener: ListenerId,
}

struct SubstackBinding {
    reconciler: Arc<TemplateReconciler>,
    update_listener: ListenerId,
    layer_listener: ListenerId,
}

impl SubstackBinding {
    fn detach(&self) {
        self.reconciler
            .template_update()
            .unsubscribe(self.update_listener);
        self.reconciler.layer_change().unsubscribe(self.layer_listener);
        self.reconciler.cleanup();
    }
}

#[derive(Default)]
struct TemplateGraph {
    layers: IndexMap<String, LayerBinding>,
    functions: IndexMap<String, Arc<FunctionEntity>>,
    compiled: IndexMap<PathBuf, Arc<CompiledDirectory>>,
    substacks: IndexMap<String, SubstackBinding>,
    parameters: Mapping,
}

/// Live graph of one template and its nested stacks
pub struct TemplateReconciler {
    /// Project-relative template path
    path: PathBuf,
    stack_name: String,
    is_substack: bool,
    ctx: Arc<Container>,
    phase: Mutex<ReloadPhase>,
    graph: Mutex<TemplateGraph>,
    template_update: Arc<Emitter<TemplateUpdate>>,
    layer_change: Arc<Emitter<LayerChange>>,
}

impl std::fmt::Debug for TemplateReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateReconciler")
            .field("path", &self.path)
            .field("stack_name", &self.stack_name)
            .field("is_substack", &self.is_substack)
            .field("phase", &self.phase())
            .finish()
    }
}

impl TemplateReconciler {
    /// Create an empty reconciler; nothing is read until [`Self::reload`]
    pub fn new(path: &Path, ctx: Arc<Container>, stack_name: &str, is_substack: bool) -> Arc<Self> {
        Arc::new(Self {
            path: normalize(path),
            stack_name: stack_name.to_string(),
            is_substack,
            ctx,
            phase: Mutex::new(ReloadPhase::Idle),
            graph: Mutex::new(TemplateGraph::default()),
            template_update: Arc::new(Emitter::new()),
            layer_change: Arc::new(Emitter::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn is_substack(&self) -> bool {
        self.is_substack
    }

    pub fn phase(&self) -> ReloadPhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Build-root location of the materialized template
    pub fn output_path(&self) -> PathBuf {
        self.ctx.mirror_path(&self.path)
    }

    pub fn template_update(&self) -> &Emitter<TemplateUpdate> {
        &self.template_update
    }

    pub fn layer_change(&self) -> &Emitter<LayerChange> {
        &self.layer_change
    }

    pub fn layers(&self) -> Vec<Arc<LayerEntity>> {
        self.lock()
            .layers
            .values()
            .map(|binding| Arc::clone(&binding.layer))
            .collect()
    }

    pub fn layer(&self, name: &str) -> Option<Arc<LayerEntity>> {
        self.lock().layers.get(name).map(|binding| Arc::clone(&binding.layer))
    }

    pub fn functions(&self) -> Vec<Arc<FunctionEntity>> {
        self.lock().functions.values().cloned().collect()
    }

    pub fn function(&self, name: &str) -> Option<Arc<FunctionEntity>> {
        self.lock().functions.get(name).cloned()
    }

    pub fn compiled_directories(&self) -> Vec<Arc<CompiledDirectory>> {
        self.lock().compiled.values().cloned().collect()
    }

    /// Compiled directory for a project-relative path
    pub fn compiled_directory(&self, path: &Path) -> Option<Arc<CompiledDirectory>> {
        self.lock().compiled.get(&normalize(path)).cloned()
    }

    pub fn substacks(&self) -> Vec<Arc<TemplateReconciler>> {
        self.lock()
            .substacks
            .values()
            .map(|binding| Arc::clone(&binding.reconciler))
            .collect()
    }

    pub fn substack(&self, name: &str) -> Option<Arc<TemplateReconciler>> {
        self.lock()
            .substacks
            .get(name)
            .map(|binding| Arc::clone(&binding.reconciler))
    }

    /// Materialized parameter declarations from the last reload
    pub fn parameters(&self) -> Mapping {
        self.lock().parameters.clone()
    }

    /// Re-parse the template and reconcile the graph against it.
    ///
    /// Construction failures (missing configuration, missing compiler
    /// configuration, unusable external libraries) abort the reload. Initial
    /// builds of newly discovered functions only log their failures.
    pub fn reload(&self) -> Result<()> {
        info!("Loading template {:?}", self.path);
        let root = self.ctx.root();
        if !root.join(CONFIG_FILE_NAME).exists() {
            return Err(SamError::MissingConfigFile(root.to_path_buf()));
        }
        if !self.is_substack {
            self.ctx.config().save(self.ctx.build_root())?;
        }

        let result = self.reconcile();
        self.set_phase(ReloadPhase::Idle);
        result?;

        self.ctx.fingerprints().mark_clean_in_memory(&self.path)?;
        self.template_update.emit(&TemplateUpdate {
            template: self.path.clone(),
        });
        Ok(())
    }

    fn reconcile(&self) -> Result<()> {
        let config = Arc::clone(self.ctx.config());
        let mut graph = self.lock();

        self.set_phase(ReloadPhase::Parsing);
        let content = std::fs::read_to_string(self.ctx.source_path(&self.path))?;
        let mut template: Value = serde_yaml::from_str(&content)?;
        if !template.is_mapping() {
            return Err(SamError::invalid_template(&self.path, "document root is not a mapping"));
        }
        let declared = template
            .get("Parameters")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        if config.env_aware() {
            debug!("Substituting environment placeholders in {:?}", self.path);
            if let Some(parameters) = template.get_mut("Parameters").and_then(Value::as_mapping_mut) {
                substitute_parameter_defaults(
                    parameters,
                    config.environment().unwrap_or(""),
                    config.dev_stack().unwrap_or(""),
                );
            }
        }

        // Resource paths are relative to the declaring template
        let base = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let resources = classify_resources(&template);

        self.set_phase(ReloadPhase::DiffingLayers);
        self.diff_layers(&mut graph, &resources, &base)?;

        let stack_resources = self.stack_resources(&resources);

        self.set_phase(ReloadPhase::DiffingFunctions);
        let global_uri = global_code_uri(&template).map(|uri| normalize(&base.join(uri)));
        self.diff_functions(&mut graph, &resources, &base, global_uri.as_deref(), &stack_resources)?;

        self.set_phase(ReloadPhase::DiffingSubstacks);
        self.diff_substacks(&mut graph, &resources, &base, &stack_resources)?;
        for (name, binding) in &graph.substacks {
            let promoted =
                promote_child_parameters(&mut template, name, &binding.reconciler.parameters());
            if !promoted.is_empty() {
                info!("Promoted nested stack parameters {:?}", promoted);
            }
        }

        self.set_phase(ReloadPhase::ParameterResolution);
        if config.resolve_layer_parameters() {
            let function_layers: Vec<Value> = graph
                .functions
                .values()
                .flat_map(|function| function.layers())
                .collect();
            resolve_layer_parameters(&mut template, &function_layers, self.ctx.cloud().as_ref());
        }
        apply_config_defaults(&mut template, &config);
        let materialized = template
            .get("Parameters")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        if !self.is_substack {
            for overlay in build_overlays(&declared, &materialized, &config) {
                overlay.save(self.ctx.build_root())?;
            }
        }
        graph.parameters = materialized;

        self.set_phase(ReloadPhase::WritingOutput);
        add_api_permissions(&mut template);
        merge_global_policies(&mut template, &self.path)?;
        if let Some(tag) = config.marker_tag() {
            add_marker_tag(&mut template, tag);
        }

        let output = self.output_path();
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if output.exists() {
            std::fs::remove_file(&output)?;
        }
        info!("Writing {:?}", output);
        std::fs::write(&output, serde_yaml::to_string(&template)?)?;
        Ok(())
    }

    fn diff_layers(
        &self,
        graph: &mut TemplateGraph,
        resources: &IndexMap<String, Resource>,
        base: &Path,
    ) -> Result<()> {
        let mut declared = Vec::new();
        for (name, resource) in resources {
            let Resource::Layer(decl) = resource else {
                continue;
            };
            let decl = LayerDecl {
                content_uri: normalize(&base.join(&decl.content_uri)),
                ..decl.clone()
            };
            declared.push(name.clone());

            if let Some(binding) = graph.layers.get(name) {
                let layer = &binding.layer;
                let before = (layer.path(), layer.package_folder());
                layer.set_config(&decl);
                if (layer.path(), layer.package_folder()) != before {
                    layer.file_event(&layer.manifest_path())?;
                }
                continue;
            }

            let layer = Arc::new(LayerEntity::new(
                name,
                &decl,
                &self.stack_name,
                Arc::clone(&self.ctx),
            )?);
            let forward = Arc::clone(&self.layer_change);
            let listener = layer
                .layer_change()
                .subscribe(move |change| forward.emit(change));
            graph.layers.insert(name.clone(), LayerBinding { layer, listener });
        }

        graph.layers.retain(|name, binding| {
            if declared.contains(name) {
                return true;
            }
            info!("Layer {} was removed from {:?}", name, self.path);
            binding.layer.layer_change().unsubscribe(binding.listener);
            binding.layer.cleanup();
            false
        });
        Ok(())
    }

    /// Live resources of this stack, listed once per reload and only when a
    /// function or nested stack needs a physical name
    fn stack_resources(&self, resources: &IndexMap<String, Resource>) -> Arc<[StackResource]> {
        let needed = resources.values().any(|resource| match resource {
            Resource::Function(decl) => decl.function_name.is_none() && !decl.inline,
            Resource::NestedStack(_) => true,
            _ => false,
        });
        if !needed || self.ctx.config().no_deploy() {
            return Arc::from(Vec::new());
        }

        match self.ctx.cloud().list_stack_resources(&self.stack_name) {
            Ok(listed) => {
                debug!("Stack {} has {} resources", self.stack_name, listed.len());
                Arc::from(listed)
            }
            Err(e) => {
                warn!("Could not list resources of stack {}: {}", self.stack_name, e);
                Arc::from(Vec::new())
            }
        }
    }

    fn diff_functions(
        &self,
        graph: &mut TemplateGraph,
        resources: &IndexMap<String, Resource>,
        base: &Path,
        global_uri: Option<&Path>,
        stack_resources: &Arc<[StackResource]>,
    ) -> Result<()> {
        let mut declared = Vec::new();
        for (name, resource) in resources {
            let Resource::Function(decl) = resource else {
                continue;
            };
            if decl.inline {
                debug!("Function {} has inline code, nothing to compile", name);
                continue;
            }
            let mut decl = decl.clone();
            decl.code_uri = decl.code_uri.map(|uri| normalize(&base.join(uri)));
            let Some(path) = decl.effective_code_uri(global_uri) else {
                warn!("Function {} declares no code path", name);
                continue;
            };
            declared.push(name.clone());

            let function = match graph.functions.get(name) {
                Some(function) => {
                    function.set_config(&decl, global_uri);
                    function.set_stack_resources(Arc::clone(stack_resources));
                    Arc::clone(function)
                }
                None => {
                    let function = FunctionEntity::new(
                        name,
                        &decl,
                        global_uri,
                        &self.stack_name,
                        Arc::clone(stack_resources),
                        Arc::clone(&self.ctx),
                    );
                    graph.functions.insert(name.clone(), Arc::clone(&function));
                    function
                }
            };

            let directory = match graph.compiled.get(&path) {
                Some(directory) => Arc::clone(directory),
                None => {
                    info!("Constructing directory to compile {:?}", path);
                    let directory = Arc::new(CompiledDirectory::new(
                        &path,
                        DirectoryKind::Function,
                        Arc::clone(&self.ctx),
                    )?);
                    let initial = directory
                        .install_at_least_once()
                        .and_then(|()| directory.build(None, true));
                    if let Err(e) = initial {
                        warn!("Initial build of {:?} failed, waiting for changes: {}", path, e);
                    }
                    graph.compiled.insert(path, Arc::clone(&directory));
                    directory
                }
            };
            function.register_compiled_directory(&directory);
        }

        graph.functions.retain(|name, function| {
            if declared.contains(name) {
                return true;
            }
            info!("Function {} was removed from {:?}", name, self.path);
            function.cleanup();
            false
        });

        let live: Vec<PathBuf> = graph.functions.values().map(|f| f.path()).collect();
        graph.compiled.retain(|path, directory| {
            if live.contains(path) {
                return true;
            }
            info!("No function builds from {:?} anymore", path);
            directory.cleanup();
            false
        });
        Ok(())
    }

    fn diff_substacks(
        &self,
        graph: &mut TemplateGraph,
        resources: &IndexMap<String, Resource>,
        base: &Path,
        stack_resources: &[StackResource],
    ) -> Result<()> {
        let mut declared = Vec::new();
        for (name, resource) in resources {
            let Resource::NestedStack(decl) = resource else {
                continue;
            };
            let location = normalize(&base.join(&decl.location));
            declared.push(name.clone());

            if let Some(binding) = graph.substacks.get(name) {
                if binding.reconciler.path() == location {
                    continue;
                }
                binding.detach();
            }

            let stack_name = nested_stack_name(stack_resources, name, &self.stack_name);
            info!("Nested stack {} ({}) from {:?}", name, stack_name, location);
            let reconciler =
                TemplateReconciler::new(&location, Arc::clone(&self.ctx), &stack_name, true);
            let forward = Arc::clone(&self.template_update);
            let update_listener = reconciler
                .template_update()
                .subscribe(move |update| forward.emit(update));
            let forward = Arc::clone(&self.layer_change);
            let layer_listener = reconciler
                .layer_change()
                .subscribe(move |change| forward.emit(change));
            graph.substacks.insert(
                name.clone(),
                SubstackBinding {
                    reconciler,
                    update_listener,
                    layer_listener,
                },
            );
        }

        graph.substacks.retain(|name, binding| {
            if declared.contains(name) {
                return true;
            }
            info!("Nested stack {} was removed from {:?}", name, self.path);
            binding.detach();
            false
        });

        let children: Vec<Arc<TemplateReconciler>> = graph
            .substacks
            .values()
            .map(|binding| Arc::clone(&binding.reconciler))
            .collect();
        children.par_iter().try_for_each(|child| child.reload())
    }

    /// Route a project-relative change to every owner containing it.
    ///
    /// The template itself reloads only when its fingerprint is stale. Every
    /// owner sees the event even if an earlier one failed; the first failure
    /// is returned.
    pub fn file_event(&self, changed: &Path) -> Result<()> {
        let changed = normalize(changed);
        if changed == self.path {
            if self.ctx.fingerprints().is_stale(&self.path)? {
                self.reload()?;
            } else {
                debug!("{:?} unchanged, skipping reload", self.path);
            }
            return Ok(());
        }

        let (compiled, layers, substacks) = {
            let graph = self.lock();
            (
                graph.compiled.values().cloned().collect::<Vec<_>>(),
                graph
                    .layers
                    .values()
                    .map(|binding| Arc::clone(&binding.layer))
                    .collect::<Vec<_>>(),
                graph
                    .substacks
                    .values()
                    .map(|binding| Arc::clone(&binding.reconciler))
                    .collect::<Vec<_>>(),
            )
        };

        let mut first_error = None;
        let mut record = |result: Result<()>| {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        };

        for directory in &compiled {
            if let Some(relative) = relative_to(&changed, directory.path()) {
                record(directory.file_event(&relative).map(|_| ()));
            }
        }
        for layer in &layers {
            if let Some(relative) = relative_to(&changed, &layer.path()) {
                record(layer.file_event(&relative));
            }
            for lib in layer.libs() {
                if let Some(relative) = relative_to(&changed, lib.path()) {
                    record(lib.file_event(&relative).map(|_| ()));
                }
            }
        }
        let mut promotion_changed = false;
        for substack in &substacks {
            let before = required_parameters(&substack.parameters());
            record(substack.file_event(&changed));
            if required_parameters(&substack.parameters()) != before {
                info!(
                    "Required parameters of nested stack {:?} changed, reloading {:?}",
                    substack.path(),
                    self.path
                );
                promotion_changed = true;
            }
        }
        if promotion_changed {
            record(self.reload());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear down the whole graph and detach every listener
    pub fn cleanup(&self) {
        let mut graph = self.lock();
        for directory in graph.compiled.values() {
            directory.cleanup();
        }
        for binding in graph.layers.values() {
            binding.layer.layer_change().unsubscribe(binding.listener);
            binding.layer.cleanup();
        }
        for function in graph.functions.values() {
            function.cleanup();
        }
        for binding in graph.substacks.values() {
            binding.detach();
        }
        *graph = TemplateGraph::default();
        self.template_update.clear();
        self.layer_change.clear();
    }

    fn set_phase(&self, phase: ReloadPhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    fn lock(&self) -> MutexGuard<'_, TemplateGraph> {
        self.graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Names of the parameters a nested stack needs its parent to pass
fn required_parameters(parameters: &Mapping) -> Vec<String> {
    parameters
        .iter()
        .filter(|(_, parameter)| parameter.get("Default").is_none())
        .filter_map(|(key, _)| key.as_str().map(str::to_string))
        .collect()
}

/// Deployed name of a nested stack, taken from the parent's physical id
/// (`arn:...:stack/<name>/<id>`) when known
fn nested_stack_name(resources: &[StackResource], logical: &str, parent: &str) -> String {
    resources
        .iter()
        .find(|resource| resource.logical_resource_id == logical)
        .and_then(|resource| resource.physical_resource_id.split('/').nth(1))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{parent}-{logical}"))
}
