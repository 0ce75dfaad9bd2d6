//! Template parameters: per-environment overlays, parameter-store layer
//! resolution and promotion of nested-stack parameters

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::postprocess::{child_mapping, substitute_placeholders};
use super::resource::{global_function, make_ref, ref_target, SSM_PARAMETER_TYPE};
use crate::cloud::CloudClient;
use crate::config::{SamConfig, BASE_SECTION};
use crate::errors::Result;

/// Build-root folder holding one overlay file per environment
pub const OVERLAY_DIR: &str = ".params";

/// Parameters to deploy with for one target environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterOverlay {
    pub environment: String,
    pub parameters: IndexMap<String, String>,
}

impl ParameterOverlay {
    pub fn path(build_root: &Path, environment: &str) -> PathBuf {
        build_root.join(OVERLAY_DIR).join(format!("{environment}.json"))
    }

    pub fn load(build_root: &Path, environment: &str) -> Result<Self> {
        let content = std::fs::read_to_string(Self::path(build_root, environment))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, build_root: &Path) -> Result<()> {
        let path = Self::path(build_root, &self.environment);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// `Key=Value` pairs for the deploy tool, skipping the stack and
    /// environment names which are passed separately
    pub fn overrides(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|(key, _)| !matches!(key.as_str(), "StackName" | "EnvironmentTagName"))
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

/// String form of a scalar YAML value
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn defaults(parameters: &Mapping) -> IndexMap<String, String> {
    parameters
        .iter()
        .filter_map(|(key, parameter)| {
            let default = parameter.get("Default").and_then(scalar_string)?;
            Some((key.as_str()?.to_string(), default))
        })
        .collect()
}

/// Overlay the deploy step reads: the current environment, or the base
/// section when none is configured
pub fn deploy_environment(config: &SamConfig) -> &str {
    config.environment().unwrap_or(BASE_SECTION)
}

/// Build one overlay per configured environment.
///
/// The overlay the deploy step reads takes the fully materialized defaults;
/// other environments take the declared defaults, with placeholders
/// substituted when the configuration is environment aware.
pub fn build_overlays(
    declared: &Mapping,
    materialized: &Mapping,
    config: &SamConfig,
) -> Vec<ParameterOverlay> {
    let current = deploy_environment(config);
    let dev_stack = config.dev_stack().unwrap_or("");

    let mut environments: Vec<&str> = config.environments().iter().map(String::as_str).collect();
    if !environments.contains(&current) {
        environments.push(current);
    }

    environments
        .into_iter()
        .map(|environment| {
            let mut parameters = if environment == current {
                defaults(materialized)
            } else {
                defaults(declared)
            };
            if config.env_aware() {
                for value in parameters.values_mut() {
                    *value = substitute_placeholders(value, environment, dev_stack);
                }
            }
            ParameterOverlay {
                environment: environment.to_string(),
                parameters,
            }
        })
        .collect()
}

/// Replace parameter-store typed layer parameters with their current values.
///
/// `function_layers` are the `Layers` entries of every function. Lookup
/// failures are logged and leave the template untouched.
pub fn resolve_layer_parameters(
    template: &mut Value,
    function_layers: &[Value],
    cloud: &dyn CloudClient,
) {
    let mut referenced: Vec<String> = Vec::new();
    let global_layers = global_function(template)
        .and_then(|globals| globals.get("Layers"))
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();
    for layer in global_layers.iter().chain(function_layers) {
        if let Some(target) = ref_target(layer) {
            if !referenced.iter().any(|r| r == target) {
                referenced.push(target.to_string());
            }
        }
    }

    let Some(parameters) = template.get_mut("Parameters").and_then(Value::as_mapping_mut) else {
        return;
    };
    let lookups: Vec<(String, String)> = referenced
        .into_iter()
        .filter_map(|name| {
            let parameter = parameters.get(name.as_str())?;
            if parameter.get("Type").and_then(Value::as_str) != Some(SSM_PARAMETER_TYPE) {
                return None;
            }
            let store_name = parameter.get("Default").and_then(Value::as_str)?;
            Some((name, store_name.to_string()))
        })
        .collect();
    if lookups.is_empty() {
        return;
    }

    let names: Vec<String> = lookups.iter().map(|(_, store)| store.clone()).collect();
    info!("Resolving {} layer parameter(s) from the parameter store", names.len());
    let values = match cloud.get_parameters(&names) {
        Ok(values) => values,
        Err(e) => {
            warn!("Could not resolve layer parameters: {}", e);
            return;
        }
    };

    for (name, store_name) in lookups {
        let Some(resolved) = values.iter().find(|value| value.name == store_name) else {
            warn!("Parameter store has no value for {}", store_name);
            continue;
        };
        if let Some(parameter) = parameters.get_mut(name.as_str()).and_then(Value::as_mapping_mut) {
            debug!("Layer parameter {} resolved to {}", name, resolved.value);
            parameter.insert("Default".into(), resolved.value.clone().into());
            parameter.insert("Type".into(), "String".into());
        }
    }
}

/// Wire a nested stack's required parameters through the parent.
///
/// Every child parameter without a default that the parent does not pass
/// explicitly becomes a parent parameter named `<Logical><Parameter>` and is
/// passed down by reference. Returns the promoted parent parameter names.
pub fn promote_child_parameters(
    template: &mut Value,
    logical_name: &str,
    child_parameters: &Mapping,
) -> Vec<String> {
    let Some(root) = template.as_mapping_mut() else {
        return Vec::new();
    };

    let passed: Vec<String> = root
        .get("Resources")
        .and_then(|resources| resources.get(logical_name))
        .and_then(|resource| resource.get("Properties"))
        .and_then(|properties| properties.get("Parameters"))
        .and_then(Value::as_mapping)
        .map(|passed| passed.keys().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();

    let required: Vec<(String, Value)> = child_parameters
        .iter()
        .filter_map(|(key, parameter)| {
            let key = key.as_str()?;
            if parameter.get("Default").is_some() || passed.iter().any(|p| p == key) {
                return None;
            }
            Some((key.to_string(), parameter.clone()))
        })
        .collect();

    let mut promoted = Vec::new();
    for (child_name, definition) in required {
        let parent_name = format!("{logical_name}{child_name}");
        if let Some(parameters) = child_mapping(root, "Parameters") {
            if !parameters.contains_key(parent_name.as_str()) {
                parameters.insert(Value::String(parent_name.clone()), definition);
            }
        }

        let passed = root
            .get_mut("Resources")
            .and_then(|resources| resources.get_mut(logical_name))
            .and_then(Value::as_mapping_mut)
            .and_then(|resource| child_mapping(resource, "Properties"))
            .and_then(|properties| child_mapping(properties, "Parameters"));
        if let Some(passed) = passed {
            passed.insert(Value::String(child_name), make_ref(&parent_name));
        }
        promoted.push(parent_name);
    }
    promoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudClient;
    use crate::config::{CliOverrides, EnvOverrides};
    use indoc::indoc;
    use tempfile::TempDir;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_layer_parameters_resolved() {
        let mut template = parse(indoc! {"
            Parameters:
              CommonLayer:
                Type: AWS::SSM::Parameter::Value<String>
                Default: /layers/common
              OtherLayer:
                Type: String
                Default: arn:aws:lambda:us-east-1:1:layer:other:1
            Globals:
              Function:
                Layers:
                  - !Ref CommonLayer
            Resources: {}
        "});
        let function_layers = vec![parse("!Ref OtherLayer")];
        let cloud = MockCloudClient::new().with_parameter("/layers/common", "arn:layer:common:7");

        resolve_layer_parameters(&mut template, &function_layers, &cloud);

        assert_eq!(
            template["Parameters"]["CommonLayer"]["Default"],
            Value::from("arn:layer:common:7")
        );
        assert_eq!(template["Parameters"]["CommonLayer"]["Type"], Value::from("String"));
        assert_eq!(
            template["Parameters"]["OtherLayer"]["Default"],
            Value::from("arn:aws:lambda:us-east-1:1:layer:other:1")
        );
    }

    #[test]
    fn test_unresolved_layer_parameter_left_alone() {
        let mut template = parse(indoc! {"
            Parameters:
              CommonLayer:
                Type: AWS::SSM::Parameter::Value<String>
                Default: /layers/missing
            Resources: {}
        "});
        let function_layers = vec![parse("Ref: CommonLayer")];

        resolve_layer_parameters(&mut template, &function_layers, &MockCloudClient::new());

        assert_eq!(
            template["Parameters"]["CommonLayer"]["Type"],
            Value::from(SSM_PARAMETER_TYPE)
        );
    }

    #[test]
    fn test_child_parameters_promoted() {
        let mut template = parse(indoc! {"
            Resources:
              Child:
                Type: AWS::Serverless::Application
                Properties:
                  Location: child.yml
                  Parameters:
                    Explicit: value
        "});
        let child = parse(indoc! {"
            Explicit:
              Type: String
            Required:
              Type: String
            Optional:
              Type: String
              Default: x
        "});

        let promoted =
            promote_child_parameters(&mut template, "Child", child.as_mapping().unwrap());

        assert_eq!(promoted, vec!["ChildRequired".to_string()]);
        assert_eq!(
            template["Parameters"]["ChildRequired"]["Type"],
            Value::from("String")
        );
        let passed = &template["Resources"]["Child"]["Properties"]["Parameters"];
        assert_eq!(ref_target(&passed["Required"]), Some("ChildRequired"));
        assert_eq!(passed["Explicit"], Value::from("value"));
        assert!(passed.get("Optional").is_none());
    }

    #[test]
    fn test_overlays_per_environment() {
        let declared = parse(indoc! {"
            TableName:
              Type: String
              Default: orders-<EnvironmentName>
            Retries:
              Type: Number
              Default: 3
            NoDefault:
              Type: String
        "});
        let mut materialized = declared.clone();
        materialized["TableName"]["Default"] = Value::from("orders-dev");

        let config = SamConfig::from_toml_str(
            indoc! {r#"
                [default.deploy.parameters]
                base_stack = "shop"
                environment = "dev"
                env_aware = "true"

                [prod.deploy.parameters]
                region = "us-west-2"
            "#},
            &CliOverrides::new(),
            &EnvOverrides::default(),
        )
        .unwrap();

        let overlays = build_overlays(
            declared.as_mapping().unwrap(),
            materialized.as_mapping().unwrap(),
            &config,
        );

        let names: Vec<_> = overlays.iter().map(|o| o.environment.as_str()).collect();
        assert_eq!(names, vec!["default", "prod", "dev"]);
        let prod = &overlays[1];
        assert_eq!(prod.parameters["TableName"], "orders-prod");
        assert_eq!(prod.parameters["Retries"], "3");
        assert!(!prod.parameters.contains_key("NoDefault"));
        assert_eq!(overlays[2].parameters["TableName"], "orders-dev");

        let temp_dir = TempDir::new().unwrap();
        overlays[2].save(temp_dir.path()).unwrap();
        let loaded = ParameterOverlay::load(temp_dir.path(), "dev").unwrap();
        assert_eq!(loaded.overrides(), vec!["TableName=orders-dev", "Retries=3"]);
    }

    #[test]
    fn test_base_overlay_materialized_without_environment() {
        let declared = parse(indoc! {"
            CommonLayer:
              Type: AWS::SSM::Parameter::Value<String>
              Default: /layers/common
        "});
        let materialized = parse(indoc! {"
            CommonLayer:
              Type: String
              Default: arn:layer:common:7
        "});
        let config = SamConfig::from_toml_str(
            indoc! {r#"
                [default.deploy.parameters]
                stack_name = "explicit"
                parm_layer = "true"
            "#},
            &CliOverrides::new(),
            &EnvOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.environment(), None);
        assert_eq!(deploy_environment(&config), BASE_SECTION);

        let overlays = build_overlays(
            declared.as_mapping().unwrap(),
            materialized.as_mapping().unwrap(),
            &config,
        );

        assert_eq!(overlays.len(), 1);
        assert_eq!(overlays[0].environment, "default");
        assert_eq!(overlays[0].overrides(), vec!["CommonLayer=arn:layer:common:7"]);
    }
}
