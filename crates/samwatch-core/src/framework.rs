//! Top-level event router
//!
//! [`Framework`] owns the root [`TemplateReconciler`], forwards file events
//! to it and runs the external build/deploy pipeline whenever the graph
//! reports a layer change or a template update. Pipeline requests are queued
//! on a channel and coalesced, so a burst of events causes one run.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::SamConfig;
use crate::di::Container;
use crate::errors::Result;
use crate::events::ListenerId;
use crate::paths::{copy_tree, normalize, relative_to};
use crate::sam::parameters::deploy_environment;
use crate::sam::{ParameterOverlay, TemplateReconciler};

/// Packaged template written by `sam package`
pub const PACKAGED_TEMPLATE: &str = "packaged.yml";

/// How long the process lives and how far the pipeline goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep watching; every trigger builds and deploys
    Watch,
    /// Build once and exit
    BuildOnly,
    /// Build and package once, then exit
    PackageOnly,
    /// Build and deploy once, then exit
    DeployOnly,
}

impl RunMode {
    pub fn from_config(config: &SamConfig) -> Self {
        if config.build_only() {
            RunMode::BuildOnly
        } else if config.package_only() {
            RunMode::PackageOnly
        } else if config.deploy_only() {
            RunMode::DeployOnly
        } else {
            RunMode::Watch
        }
    }

    pub fn is_watch(self) -> bool {
        self == RunMode::Watch
    }
}

/// Why the pipeline was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineTrigger {
    Layer(String),
    Template(PathBuf),
    Include(PathBuf),
}

pub struct Framework {
    template_path: PathBuf,
    ctx: Arc<Container>,
    mode: RunMode,
    template: Arc<TemplateReconciler>,
    triggers: (Sender<PipelineTrigger>, Receiver<PipelineTrigger>),
    /// Layer-change and template-update subscriptions on the root graph
    listeners: Mutex<Option<(ListenerId, ListenerId)>>,
}

impl Framework {
    pub fn new(template_path: &Path, ctx: Arc<Container>) -> Self {
        let template_path = normalize(template_path);
        let mode = RunMode::from_config(ctx.config());
        let template = TemplateReconciler::new(
            &template_path,
            Arc::clone(&ctx),
            ctx.config().stack_name(),
            false,
        );
        Self {
            template_path,
            ctx,
            mode,
            template,
            triggers: unbounded(),
            listeners: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    pub fn template(&self) -> &Arc<TemplateReconciler> {
        &self.template
    }

    /// Initial reload, library builds and (unless suppressed) the first
    /// pipeline run. In watch mode the graph's events are wired to the
    /// pipeline queue afterwards.
    pub fn load(&self) -> Result<()> {
        info!("Loading framework for {:?}", self.template_path);
        self.ctx.ensure_layout()?;
        self.template.reload()?;
        self.build_libraries();
        self.copy_includes()?;

        if !self.mode.is_watch() {
            return self.run_pipeline();
        }

        if self.ctx.config().skip_init_deploy() {
            info!("Skipping initial deployment");
        } else if let Err(e) = self.run_pipeline() {
            error!("Initial deployment failed: {}", e);
        }
        self.subscribe();
        Ok(())
    }

    /// Full build of every layer library so first-time compilation finishes
    /// before the pipeline runs
    fn build_libraries(&self) {
        let mut reconcilers = vec![Arc::clone(&self.template)];
        while let Some(reconciler) = reconcilers.pop() {
            for layer in reconciler.layers() {
                for lib in layer.libs() {
                    if let Err(e) = lib.build(None, true) {
                        warn!("Initial build of library {:?} failed: {}", lib.path(), e);
                    }
                }
            }
            reconcilers.extend(reconciler.substacks());
        }
    }

    fn subscribe(&self) {
        let sender = self.triggers.0.clone();
        let layer = self.template.layer_change().subscribe(move |change| {
            let _ = sender.send(PipelineTrigger::Layer(change.layer.clone()));
        });

        let sender = self.triggers.0.clone();
        let update = self.template.template_update().subscribe(move |update| {
            let _ = sender.send(PipelineTrigger::Template(update.template.clone()));
        });

        *self.listeners.lock().unwrap_or_else(|p| p.into_inner()) = Some((layer, update));
    }

    /// Route one project-relative change
    pub fn file_event(&self, path: &Path) -> Result<()> {
        let path = normalize(path);
        let included = self.copy_includes_under(&path).unwrap_or_else(|e| {
            error!("Failed to copy include path for {:?}: {}", path, e);
            None
        });
        let routed = self.template.file_event(&path);
        if let Some(include) = included {
            info!("Include path {:?} changed", include);
            let _ = self.triggers.0.send(PipelineTrigger::Include(include));
        }
        routed
    }

    /// Project-relative paths matched by the configured include globs
    fn include_paths(&self) -> Vec<PathBuf> {
        let root = self.ctx.root();
        let mut paths = Vec::new();
        for pattern in self.ctx.config().include_patterns() {
            let full = root.join(&pattern);
            let matches = match glob::glob(&full.to_string_lossy()) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!("Ignoring include pattern {:?}: {}", pattern, e);
                    continue;
                }
            };
            for entry in matches.flatten() {
                if let Ok(relative) = entry.strip_prefix(root) {
                    paths.push(relative.to_path_buf());
                }
            }
        }
        paths
    }

    fn copy_include(&self, include: &Path) -> Result<()> {
        let source = self.ctx.source_path(include);
        let target = self.ctx.mirror_path(include);
        if source.is_dir() {
            let copied = copy_tree(&source, &target, |_, _| true)?;
            debug!("Copied {} file(s) from {:?}", copied, include);
        } else if source.exists() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &target)?;
        }
        Ok(())
    }

    /// Copy every include path into the build root
    pub fn copy_includes(&self) -> Result<usize> {
        let includes = self.include_paths();
        for include in &includes {
            self.copy_include(include)?;
        }
        Ok(includes.len())
    }

    /// Re-copy the include path containing `path`, if any
    fn copy_includes_under(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some(include) = self
            .include_paths()
            .into_iter()
            .find(|include| relative_to(path, include).is_some())
        else {
            return Ok(None);
        };
        self.copy_include(&include)?;
        Ok(Some(include))
    }

    /// Run `sam build`, then package or deploy depending on the run mode
    pub fn run_pipeline(&self) -> Result<()> {
        let toolchain = self.ctx.toolchain();
        let build_root = self.ctx.build_root();

        info!("Building SAM deployment");
        toolchain.sam(&["build".to_string()], build_root)?;

        match self.mode {
            RunMode::BuildOnly => Ok(()),
            RunMode::PackageOnly => {
                info!("Packaging SAM deployment");
                toolchain.sam(&self.package_args(), build_root)
            }
            RunMode::Watch | RunMode::DeployOnly => {
                info!("Deploying stack {}", self.ctx.config().stack_name());
                toolchain.sam(&self.deploy_args(), build_root)
            }
        }
    }

    fn package_args(&self) -> Vec<String> {
        let config = self.ctx.config();
        let mut args = vec![
            "package".to_string(),
            "--output-template-file".to_string(),
            PACKAGED_TEMPLATE.to_string(),
        ];
        if let Some(bucket) = config.s3_bucket() {
            args.extend(["--s3-bucket".to_string(), bucket.to_string()]);
        }
        if let Some(prefix) = config.s3_prefix() {
            args.extend(["--s3-prefix".to_string(), prefix.to_string()]);
        }
        args
    }

    fn deploy_args(&self) -> Vec<String> {
        let config = self.ctx.config();
        let mut args = vec![
            "deploy".to_string(),
            "--no-fail-on-empty-changeset".to_string(),
            "--no-confirm-changeset".to_string(),
        ];

        let mut overrides = Vec::new();
        if let Some(base_stack) = config.base_stack() {
            overrides.push(format!("StackName={base_stack}"));
            overrides.push(format!(
                "EnvironmentTagName={}",
                config.environment().unwrap_or_default()
            ));
        }
        let environment = deploy_environment(config);
        match ParameterOverlay::load(self.ctx.build_root(), environment) {
            Ok(overlay) => overrides.extend(overlay.overrides()),
            Err(e) => warn!("No parameter overlay for {}: {}", environment, e),
        }

        if !overrides.is_empty() {
            args.push("--parameter-overrides".to_string());
            args.extend(overrides);
        }
        args
    }

    /// Run the pipeline once if anything requested it since the last run.
    ///
    /// Returns whether the pipeline ran.
    pub fn run_pending(&self) -> Result<bool> {
        let pending: Vec<PipelineTrigger> = self.triggers.1.try_iter().collect();
        if pending.is_empty() {
            return Ok(false);
        }
        debug!("Pipeline requested by {:?}", pending);
        self.run_pipeline()?;
        Ok(true)
    }

    /// Detach from the graph and tear it down
    pub fn cleanup(&self) {
        let listeners = self.listeners.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some((layer, update)) = listeners {
            self.template.layer_change().unsubscribe(layer);
            self.template.template_update().unsubscribe(update);
        }
        self.template.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudClient;
    use crate::config::{CliOverrides, EnvOverrides, SamConfig, CONFIG_FILE_NAME};
    use crate::toolchain::MockToolchain;
    use indoc::indoc;
    use std::fs;
    use tempfile::TempDir;

    const TEMPLATE: &str = indoc! {"
        Parameters:
          StackName:
            Type: String
          TableName:
            Type: String
            Default: orders
        Resources:
          Orders:
            Type: AWS::Serverless::Function
            Properties:
              CodeUri: src/orders
              FunctionName: orders-fn
    "};

    fn framework(flags: CliOverrides) -> (TempDir, Arc<MockToolchain>, Framework) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let samconfig = indoc! {r#"
            [default.deploy.parameters]
            base_stack = "shop"
            environment = "dev"
            include = "static"
        "#};
        fs::write(root.join(CONFIG_FILE_NAME), samconfig).unwrap();
        fs::write(root.join("tsconfig.json"), "{}").unwrap();
        fs::write(root.join("template.yml"), TEMPLATE).unwrap();
        fs::create_dir_all(root.join("src/orders")).unwrap();
        fs::write(root.join("src/orders/index.ts"), "export {}").unwrap();
        fs::create_dir_all(root.join("static")).unwrap();
        fs::write(root.join("static/index.html"), "<html/>").unwrap();

        let config = SamConfig::from_toml_str(samconfig, &flags, &EnvOverrides::default()).unwrap();
        let toolchain = Arc::new(MockToolchain::new());
        let ctx = Arc::new(Container::with_dependencies(
            root,
            config,
            toolchain.clone(),
            Arc::new(MockCloudClient::new()),
        ));
        let framework = Framework::new(Path::new("template.yml"), ctx);
        (temp_dir, toolchain, framework)
    }

    fn framework_with(flag: &str) -> (TempDir, Arc<MockToolchain>, Framework) {
        framework(CliOverrides::new().with(flag, "true"))
    }

    #[test]
    fn test_run_mode_from_flags() {
        let (_temp_dir, _toolchain, watch) = framework(CliOverrides::new());
        assert_eq!(watch.mode(), RunMode::Watch);

        let (_temp_dir, _toolchain, package) = framework_with("package_only");
        assert_eq!(package.mode(), RunMode::PackageOnly);
    }

    #[test]
    fn test_package_only_packages_instead_of_deploying() {
        let (_temp_dir, toolchain, framework) = framework(
            CliOverrides::new()
                .with("package_only", "true")
                .with("s3_bucket", "artifacts"),
        );
        framework.load().unwrap();

        let invocations = toolchain.sam_invocations();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[1][0], "package");
        assert!(invocations[1].contains(&"artifacts".to_string()));
    }

    #[test]
    fn test_initial_pipeline_deploys_with_overrides() {
        let (temp_dir, toolchain, framework) = framework(CliOverrides::new());
        framework.load().unwrap();

        let invocations = toolchain.sam_invocations();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0], vec!["build"]);
        let deploy = &invocations[1];
        assert_eq!(deploy[0], "deploy");
        assert!(deploy.contains(&"--no-confirm-changeset".to_string()));
        assert!(deploy.contains(&"StackName=shop".to_string()));
        assert!(deploy.contains(&"EnvironmentTagName=dev".to_string()));
        assert!(deploy.contains(&"TableName=orders".to_string()));
        assert!(temp_dir.path().join(".build/root/static/index.html").exists());
    }

    #[test]
    fn test_skip_init_deploy() {
        let (_temp_dir, toolchain, framework) = framework_with("skip_init_deploy");
        framework.load().unwrap();
        assert!(toolchain.sam_invocations().is_empty());
        assert!(!framework.run_pending().unwrap());
    }

    #[test]
    fn test_build_only_stops_after_build() {
        let (_temp_dir, toolchain, framework) = framework_with("build_only");
        framework.load().unwrap();
        assert_eq!(toolchain.sam_invocations(), vec![vec!["build".to_string()]]);
    }

    #[test]
    fn test_include_change_queues_one_pipeline_run() {
        let (temp_dir, toolchain, framework) = framework_with("skip_init_deploy");
        framework.load().unwrap();

        fs::write(temp_dir.path().join("static/index.html"), "<html>v2</html>").unwrap();
        framework.file_event(Path::new("static/index.html")).unwrap();
        framework.file_event(Path::new("static/index.html")).unwrap();

        assert_eq!(
            fs::read_to_string(temp_dir.path().join(".build/root/static/index.html")).unwrap(),
            "<html>v2</html>"
        );
        assert!(framework.run_pending().unwrap());
        assert_eq!(toolchain.sam_invocations().len(), 2);
        assert!(!framework.run_pending().unwrap());
    }

    #[test]
    fn test_failed_include_copy_still_routes_change() {
        let (temp_dir, toolchain, framework) = framework(
            CliOverrides::new()
                .with("include", "src/orders/index.ts")
                .with("skip_init_deploy", "true"),
        );
        framework.load().unwrap();
        let mirrored = temp_dir.path().join(".build/root/src/orders/index.ts");
        fs::remove_file(&mirrored).unwrap();
        fs::create_dir_all(mirrored.join("blocked")).unwrap();
        toolchain.clear_calls();

        fs::write(temp_dir.path().join("src/orders/index.ts"), "export const v = 2").unwrap();
        let modified = std::time::SystemTime::now() + std::time::Duration::from_secs(10);
        fs::File::options()
            .write(true)
            .open(temp_dir.path().join("src/orders/index.ts"))
            .unwrap()
            .set_modified(modified)
            .unwrap();
        framework.file_event(Path::new("src/orders/index.ts")).unwrap();

        assert_eq!(toolchain.compile_count(), 1);
        assert!(!framework.run_pending().unwrap());
    }
}
