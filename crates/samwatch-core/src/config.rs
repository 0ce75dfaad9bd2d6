use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use crate::errors::{Result, SamError};

/// Deployment configuration file expected at the project root
pub const CONFIG_FILE_NAME: &str = "samconfig.toml";

/// Section every configuration starts from
pub const BASE_SECTION: &str = "default";

/// Environment variable carrying an externally managed deployment config
pub const EXTERNAL_CONFIG_VAR: &str = "stackery_config";

/// Environment variable naming the target region
pub const REGION_VAR: &str = "AWS_REGION";

/// Flag values supplied on the command line; these win over every file value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    values: IndexMap<String, String>,
}

impl CliOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a flag, normalizing `kebab-case` keys to the file's `snake_case`
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.replace('-', "_"), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

/// Process environment inputs that feed the configuration
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub external_config: Option<String>,
    pub region: Option<String>,
}

impl EnvOverrides {
    pub fn from_process() -> Self {
        Self {
            external_config: std::env::var(EXTERNAL_CONFIG_VAR).ok(),
            region: std::env::var(REGION_VAR).ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExternalConfig {
    stack_name: Option<String>,
    environment_name: Option<String>,
    region: Option<String>,
    s3_bucket_name: Option<String>,
    cloud_formation_stack_name: Option<String>,
}

impl ExternalConfig {
    fn parse(raw: &str) -> Result<Self> {
        // Some launchers pass the JSON with its quotes escaped
        let json = if raw.contains("\\\"") {
            serde_json::from_str::<String>(&format!("\"{raw}\""))?
        } else {
            raw.to_string()
        };
        Ok(serde_json::from_str(&json)?)
    }

    fn apply(self, values: &mut IndexMap<String, String>) {
        let pairs = [
            ("base_stack", self.stack_name),
            ("environment", self.environment_name),
            ("region", self.region),
            ("s3_bucket", self.s3_bucket_name),
            ("stack_name", self.cloud_formation_stack_name),
        ];
        for (key, value) in pairs {
            if let Some(value) = value {
                values.insert(key.to_string(), value);
            }
        }
    }
}

/// Flat key/value deployment configuration, read-only once loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamConfig {
    values: IndexMap<String, String>,
    environments: Vec<String>,
    stack_name: String,
}

impl SamConfig {
    /// Load `samconfig.toml` from the project root and merge overrides.
    ///
    /// A missing file is fatal.
    pub fn load(root: &Path, flags: &CliOverrides, env: &EnvOverrides) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Err(SamError::MissingConfigFile(root.to_path_buf()));
        }
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content, flags, env)
    }

    /// Build a configuration from file content plus overrides
    pub fn from_toml_str(content: &str, flags: &CliOverrides, env: &EnvOverrides) -> Result<Self> {
        let document: toml::Table = content.parse()?;

        let environments: Vec<String> = document
            .iter()
            .filter(|(_, value)| value.is_table())
            .map(|(key, _)| key.clone())
            .collect();

        let mut values = flatten_section(&document, BASE_SECTION);

        let external = env
            .external_config
            .as_deref()
            .map(ExternalConfig::parse)
            .transpose()?;

        let environment = flags
            .get("environment")
            .map(str::to_string)
            .or_else(|| external.as_ref().and_then(|e| e.environment_name.clone()))
            .or_else(|| values.get("environment").cloned());

        if let Some(environment) = environment.as_deref() {
            if environment != BASE_SECTION {
                debug!("Merging configuration section {}", environment);
                values.extend(flatten_section(&document, environment));
            }
        }

        if let Some(external) = external {
            info!("Applying external deployment configuration");
            external.apply(&mut values);
        }

        if !values.contains_key("region") {
            if let Some(region) = &env.region {
                values.insert("region".to_string(), region.clone());
            }
        }

        for (key, value) in flags.iter() {
            values.insert(key.clone(), value.clone());
        }

        let stack_name = match values.get("stack_name") {
            Some(name) if !name.is_empty() => name.clone(),
            _ => match (values.get("base_stack"), values.get("environment")) {
                (Some(base), Some(environment)) => format!("{base}-{environment}"),
                _ => return Err(SamError::UnresolvedStackName),
            },
        };
        values.insert("stack_name".to_string(), stack_name.clone());

        for (key, value) in &values {
            debug!("config: {} = {}", key, value);
        }

        Ok(Self {
            values,
            environments,
            stack_name,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Boolean flag; only the literal `true` enables it
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn values(&self) -> &IndexMap<String, String> {
        &self.values
    }

    /// Resolved target stack name
    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn base_stack(&self) -> Option<&str> {
        self.get("base_stack")
    }

    pub fn environment(&self) -> Option<&str> {
        self.get("environment")
    }

    pub fn dev_stack(&self) -> Option<&str> {
        self.get("dev_stack")
    }

    pub fn region(&self) -> Option<&str> {
        self.get("region")
    }

    pub fn marker_tag(&self) -> Option<&str> {
        self.get("marker_tag").filter(|tag| !tag.is_empty())
    }

    pub fn stack_reference_layer(&self) -> Option<&str> {
        self.get("stack_reference_layer")
    }

    /// Glob patterns always copied into the build root
    pub fn include_patterns(&self) -> Vec<String> {
        self.get("include")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every section declared in the configuration file
    pub fn environments(&self) -> &[String] {
        &self.environments
    }

    pub fn env_aware(&self) -> bool {
        self.flag("env_aware")
    }

    pub fn resolve_layer_parameters(&self) -> bool {
        self.flag("parm_layer")
    }

    pub fn no_deploy(&self) -> bool {
        self.flag("no_deploy")
    }

    pub fn build_only(&self) -> bool {
        self.flag("build_only")
    }

    pub fn package_only(&self) -> bool {
        self.flag("package_only")
    }

    pub fn deploy_only(&self) -> bool {
        self.flag("deploy_only")
    }

    pub fn skip_init_deploy(&self) -> bool {
        self.flag("skip_init_deploy")
    }

    pub fn s3_bucket(&self) -> Option<&str> {
        self.get("s3_bucket")
    }

    pub fn s3_prefix(&self) -> Option<&str> {
        self.get("s3_prefix")
    }

    pub fn debug(&self) -> bool {
        self.flag("debug")
    }

    /// Render the generated copy kept next to the materialized template
    pub fn to_toml_string(&self) -> String {
        let mut out = format!("version = 0.1\n\n[{BASE_SECTION}.deploy.parameters]\n");
        for (key, value) in &self.values {
            out.push_str(&format!(
                "{} = {}\n",
                key,
                toml::Value::String(value.clone())
            ));
        }
        out
    }

    /// Write the generated configuration into the build root
    pub fn save(&self, build_root: &Path) -> Result<()> {
        std::fs::create_dir_all(build_root)?;
        std::fs::write(build_root.join(CONFIG_FILE_NAME), self.to_toml_string())?;
        Ok(())
    }
}

/// Flatten every `<section>.<command>.parameters` table into one bag
fn flatten_section(document: &toml::Table, section: &str) -> IndexMap<String, String> {
    let mut values = IndexMap::new();
    let Some(commands) = document.get(section).and_then(toml::Value::as_table) else {
        return values;
    };

    for command in commands.values().filter_map(toml::Value::as_table) {
        let Some(parameters) = command.get("parameters").and_then(toml::Value::as_table) else {
            continue;
        };
        for (key, value) in parameters {
            values.insert(key.clone(), scalar_string(value));
        }
    }
    values
}

fn scalar_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Array(items) => items
            .iter()
            .map(scalar_string)
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}
