//! Deployable functions bound to a compiled directory

use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{error, info};

use super::compiled_directory::CompiledDirectory;
use super::resource::FunctionDecl;
use crate::cloud::StackResource;
use crate::di::Container;
use crate::errors::{Result, SamError};
use crate::events::{DeployComplete, Emitter, ListenerId};

struct Binding {
    directory: Arc<CompiledDirectory>,
    listener: ListenerId,
}

struct FunctionState {
    path: PathBuf,
    function_name: Option<String>,
    layers: Vec<Value>,
    resources: Arc<[StackResource]>,
    binding: Option<Binding>,
}

/// A function whose code is pushed straight to the deployed stack
pub struct FunctionEntity {
    name: String,
    stack_name: String,
    ctx: Arc<Container>,
    state: Mutex<FunctionState>,
    deploy_complete: Emitter<DeployComplete>,
    this: Weak<FunctionEntity>,
}

impl FunctionEntity {
    pub fn new(
        name: &str,
        decl: &FunctionDecl,
        global_code_uri: Option<&Path>,
        stack_name: &str,
        resources: Arc<[StackResource]>,
        ctx: Arc<Container>,
    ) -> Arc<Self> {
        let function = Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            stack_name: stack_name.to_string(),
            ctx,
            state: Mutex::new(FunctionState {
                path: PathBuf::new(),
                function_name: None,
                layers: Vec::new(),
                resources,
                binding: None,
            }),
            deploy_complete: Emitter::new(),
            this: this.clone(),
        });
        function.set_config(decl, global_code_uri);
        function
    }

    /// Apply a (possibly changed) declaration from a template reload
    pub fn set_config(&self, decl: &FunctionDecl, global_code_uri: Option<&Path>) {
        let mut state = self.lock();
        state.path = decl.effective_code_uri(global_code_uri).unwrap_or_default();
        state.layers = decl.layers.clone();
        // Without an explicit name the physical id is looked up again
        state.function_name = decl.function_name.clone();
    }

    /// Replace the pre-fetched list of deployed stack resources
    pub fn set_stack_resources(&self, resources: Arc<[StackResource]>) {
        self.lock().resources = resources;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    /// Project-relative code path
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Raw `Layers` entries from the declaration
    pub fn layers(&self) -> Vec<Value> {
        self.lock().layers.clone()
    }

    pub fn deploy_complete(&self) -> &Emitter<DeployComplete> {
        &self.deploy_complete
    }

    /// Compiled directory currently delivering packages to this function
    pub fn compiled_directory(&self) -> Option<Arc<CompiledDirectory>> {
        self.lock()
            .binding
            .as_ref()
            .map(|binding| Arc::clone(&binding.directory))
    }

    /// Bind to a compiled directory's packages, detaching any previous binding
    pub fn register_compiled_directory(&self, directory: &Arc<CompiledDirectory>) {
        let mut state = self.lock();
        if let Some(existing) = &state.binding {
            if Arc::ptr_eq(&existing.directory, directory) {
                return;
            }
        }
        if let Some(previous) = state.binding.take() {
            previous.directory.packages().unsubscribe(previous.listener);
        }

        let this = self.this.clone();
        let listener = directory.packages().subscribe(move |artifact| {
            if let Some(function) = this.upgrade() {
                function.deploy_function(artifact);
            }
        });
        state.binding = Some(Binding {
            directory: Arc::clone(directory),
            listener,
        });
    }

    /// Physical name of the deployed function
    pub fn deployed_name(&self) -> Result<String> {
        let mut state = self.lock();
        if let Some(name) = &state.function_name {
            return Ok(name.clone());
        }
        let resource = state
            .resources
            .iter()
            .find(|resource| resource.logical_resource_id == self.name)
            .ok_or_else(|| SamError::FunctionNotDeployed(self.name.clone()))?;
        let physical = resource.physical_resource_id.clone();
        state.function_name = Some(physical.clone());
        Ok(physical)
    }

    /// Replace the deployed function's code with a packaged artifact.
    ///
    /// Failures are logged and never propagated.
    pub fn deploy_function(&self, zip: &[u8]) {
        let complete = DeployComplete {
            function: self.name.clone(),
        };
        if self.ctx.config().no_deploy() {
            self.deploy_complete.emit(&complete);
            return;
        }

        info!("Deploying function {}", self.name);
        let result = self
            .deployed_name()
            .and_then(|name| self.ctx.cloud().update_function_code(&name, zip));
        match result {
            Ok(()) => {
                info!("Function deployment complete {}", self.name);
                self.deploy_complete.emit(&complete);
            }
            Err(e) => error!("Function deployment FAILED {}: {}", self.name, e),
        }
    }

    /// Detach from the compiled directory
    pub fn cleanup(&self) {
        if let Some(binding) = self.lock().binding.take() {
            binding.directory.packages().unsubscribe(binding.listener);
        }
        self.deploy_complete.clear();
    }

    fn lock(&self) -> MutexGuard<'_, FunctionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
