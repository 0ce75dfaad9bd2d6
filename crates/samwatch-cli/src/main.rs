use anyhow::Context;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use samwatch_core::config::{CliOverrides, EnvOverrides, SamConfig};
use samwatch_core::paths::in_modules_dir;
use samwatch_core::{Container, Framework};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Template names tried, in order, when `--template` is not given
const TEMPLATE_CANDIDATES: &[&str] = &["template.yml", "template.yaml"];

/// Top-level folders whose events never reach the framework
const IGNORED_ROOTS: &[&str] = &[".build", ".git"];

/// Quiet period before a batch of file events is routed
const DEBOUNCE: Duration = Duration::from_millis(100);

/// samwatch - incremental build and deploy loop for SAM TypeScript projects
#[derive(Parser, Debug, Clone)]
#[command(name = "samwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project root holding samconfig.toml and the template
    #[arg(long, value_name = "DIR", default_value = ".")]
    root: PathBuf,

    /// Template file, relative to the project root
    #[arg(short, long, value_name = "FILE")]
    template: Option<PathBuf>,

    /// Named environment section of samconfig.toml
    #[arg(short, long, value_name = "NAME")]
    environment: Option<String>,

    /// Explicit target stack name
    #[arg(long, value_name = "NAME")]
    stack_name: Option<String>,

    /// Base stack name, combined with the environment
    #[arg(long, value_name = "NAME")]
    base_stack: Option<String>,

    #[arg(long, value_name = "REGION")]
    region: Option<String>,

    #[arg(long, value_name = "BUCKET")]
    s3_bucket: Option<String>,

    #[arg(long, value_name = "PREFIX")]
    s3_prefix: Option<String>,

    /// Comma-separated globs always copied into the build root
    #[arg(long, value_name = "GLOBS")]
    include: Option<String>,

    /// Substitute environment placeholders in parameter defaults
    #[arg(long)]
    env_aware: bool,

    /// Resolve parameter-store layer references before deploying
    #[arg(long)]
    parm_layer: bool,

    /// Never deploy function code directly
    #[arg(long)]
    no_deploy: bool,

    /// Build once and exit
    #[arg(long)]
    build_only: bool,

    /// Build and package once, then exit
    #[arg(long)]
    package_only: bool,

    /// Build and deploy once, then exit
    #[arg(long)]
    deploy_only: bool,

    /// Do not run the pipeline when watching starts
    #[arg(long)]
    skip_init_deploy: bool,

    /// Log at debug level
    #[arg(long)]
    debug: bool,

    /// Arbitrary configuration override
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    set: Vec<(String, String)>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        let mut flags = CliOverrides::new();
        let values = [
            ("environment", &self.environment),
            ("stack_name", &self.stack_name),
            ("base_stack", &self.base_stack),
            ("region", &self.region),
            ("s3_bucket", &self.s3_bucket),
            ("s3_prefix", &self.s3_prefix),
            ("include", &self.include),
        ];
        for (key, value) in values {
            if let Some(value) = value {
                flags.set(key, value.clone());
            }
        }

        let switches = [
            ("env_aware", self.env_aware),
            ("parm_layer", self.parm_layer),
            ("no_deploy", self.no_deploy),
            ("build_only", self.build_only),
            ("package_only", self.package_only),
            ("deploy_only", self.deploy_only),
            ("skip_init_deploy", self.skip_init_deploy),
            ("debug", self.debug),
        ];
        for (key, enabled) in switches {
            if enabled {
                flags.set(key, "true");
            }
        }

        for (key, value) in &self.set {
            flags.set(key, value.clone());
        }
        flags
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("Project root {:?} does not exist", cli.root))?;
    let template = discover_template(&root, cli.template.as_deref())?;
    let config = SamConfig::load(&root, &cli.overrides(), &EnvOverrides::from_process())
        .context("Failed to load configuration")?;

    // Set RUST_LOG=debug for detailed logs; --debug does the same
    let level = if config.debug() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("samwatch - stack {} in {:?}", config.stack_name(), root);
    debug!("Resolved configuration: {:?}", config.values());

    let ctx = Arc::new(Container::new(&root, config));
    let framework = Framework::new(&template, ctx);
    framework.load().context("Initial load failed")?;

    if !framework.mode().is_watch() {
        framework.cleanup();
        return Ok(());
    }
    watch_mode(&root, &framework)
}

/// Resolve the template path relative to the project root
fn discover_template(root: &Path, explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(explicit) = explicit {
        if !root.join(explicit).is_file() {
            anyhow::bail!("Template {:?} not found in {:?}", explicit, root);
        }
        return Ok(explicit.to_path_buf());
    }
    TEMPLATE_CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| root.join(candidate).is_file())
        .with_context(|| format!("No template.yml or template.yaml found in {root:?}"))
}

/// Project-relative form of a watched path, or `None` when the path is
/// build output, version control state or installed packages
fn watch_relative(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    let first = relative.components().next()?;
    if let Component::Normal(name) = first {
        if IGNORED_ROOTS.iter().any(|ignored| name == *ignored) {
            return None;
        }
    }
    if in_modules_dir(relative) {
        return None;
    }
    Some(relative.to_path_buf())
}

fn watch_mode(root: &Path, framework: &Framework) -> anyhow::Result<()> {
    use notify::{event::EventKind, Event, RecursiveMode, Watcher};

    let (tx, rx) = crossbeam_channel::unbounded();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .with_context(|| format!("Failed to watch {root:?}"))?;

    info!("Watching for changes... (Press Ctrl+C to stop)");

    let mut pending: Vec<PathBuf> = Vec::new();
    loop {
        match rx.recv_timeout(DEBOUNCE) {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                );
                if !relevant {
                    continue;
                }
                for path in &event.paths {
                    if let Some(relative) = watch_relative(root, path) {
                        if !pending.contains(&relative) {
                            pending.push(relative);
                        }
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                for path in pending.drain(..) {
                    debug!("File changed: {:?}", path);
                    if let Err(e) = framework.file_event(&path) {
                        error!("Handling change to {:?} failed: {}", path, e);
                    }
                }
                if let Err(e) = framework.run_pending() {
                    error!("Deployment failed: {}", e);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow::anyhow!("File watcher disconnected"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_relative_drops_generated_paths() {
        let root = Path::new("/project");
        assert_eq!(
            watch_relative(root, Path::new("/project/src/f1/index.ts")),
            Some(PathBuf::from("src/f1/index.ts"))
        );
        assert_eq!(watch_relative(root, Path::new("/project/.build/root/x.js")), None);
        assert_eq!(watch_relative(root, Path::new("/project/.git/HEAD")), None);
        assert_eq!(
            watch_relative(root, Path::new("/project/src/f1/node_modules/a/index.js")),
            None
        );
        assert_eq!(watch_relative(root, Path::new("/elsewhere/index.ts")), None);
    }

    #[test]
    fn test_watch_relative_keeps_dot_prefixed_siblings() {
        let root = Path::new("/project");
        assert_eq!(
            watch_relative(root, Path::new("/project/.buildkite/pipeline.yml")),
            Some(PathBuf::from(".buildkite/pipeline.yml"))
        );
    }

    #[test]
    fn test_cli_flags_become_overrides() {
        let cli = Cli::parse_from([
            "samwatch",
            "--environment",
            "prod",
            "--build-only",
            "--set",
            "marker-tag=owner",
        ]);
        let flags = cli.overrides();
        assert_eq!(flags.get("environment"), Some("prod"));
        assert_eq!(flags.get("build_only"), Some("true"));
        assert_eq!(flags.get("marker_tag"), Some("owner"));
        assert_eq!(flags.get("deploy_only"), None);
    }

    #[test]
    fn test_set_requires_key_value() {
        assert!(parse_key_value("region").is_err());
        assert!(parse_key_value("=x").is_err());
        assert_eq!(
            parse_key_value("s3_prefix=a=b").unwrap(),
            ("s3_prefix".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn test_discover_template_prefers_yml() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("template.yaml"), "").unwrap();
        assert_eq!(
            discover_template(temp_dir.path(), None).unwrap(),
            PathBuf::from("template.yaml")
        );
        std::fs::write(temp_dir.path().join("template.yml"), "").unwrap();
        assert_eq!(
            discover_template(temp_dir.path(), None).unwrap(),
            PathBuf::from("template.yml")
        );
        assert!(discover_template(temp_dir.path(), Some(Path::new("other.yml"))).is_err());
    }
}
