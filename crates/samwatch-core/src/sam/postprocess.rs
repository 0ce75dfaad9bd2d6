//! Fixed rewrites applied to every materialized template

use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::debug;

use super::resource::{make_ref, ref_target, FUNCTION_TYPE, PERMISSION_TYPE};
use crate::config::SamConfig;
use crate::errors::{Result, SamError};

const INVOKE_ACTION: &str = "lambda:InvokeFunction";
const DEFAULT_REST_API: &str = "ServerlessRestApi";

/// Mapping under `key`, created empty if missing
pub(crate) fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> Option<&'a mut Mapping> {
    if !parent.contains_key(key) {
        parent.insert(Value::from(key), Value::Mapping(Mapping::new()));
    }
    parent.get_mut(key).and_then(Value::as_mapping_mut)
}

fn tagged(tag: &str, value: Value) -> Value {
    Value::Tagged(Box::new(TaggedValue {
        tag: Tag::new(tag),
        value,
    }))
}

fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("Type").and_then(Value::as_str)
}

fn api_events(resource: &Value) -> Vec<&Value> {
    resource
        .get("Properties")
        .and_then(|properties| properties.get("Events"))
        .and_then(Value::as_mapping)
        .map(|events| {
            events
                .values()
                .filter(|event| {
                    event.get("Type").and_then(Value::as_str) == Some("Api")
                        && event.get("Properties").is_some()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn has_invoke_permission(resources: &Mapping, function: &str) -> bool {
    resources.values().any(|resource| {
        let Some(properties) = resource.get("Properties") else {
            return false;
        };
        resource_type(resource) == Some(PERMISSION_TYPE)
            && properties.get("Action").and_then(Value::as_str) == Some(INVOKE_ACTION)
            && properties
                .get("FunctionName")
                .and_then(ref_target)
                .is_some_and(|target| target == function)
    })
}

/// Add an explicit invoke permission for functions with an implicit API
/// trigger, which the deploy tool does not grant for global APIs
pub fn add_api_permissions(template: &mut Value) {
    let Some(resources) = template.get_mut("Resources").and_then(Value::as_mapping_mut) else {
        return;
    };

    let mut additions = Vec::new();
    for (key, resource) in resources.iter() {
        let Some(function) = key.as_str() else {
            continue;
        };
        if resource_type(resource) != Some(FUNCTION_TYPE) {
            continue;
        }
        let events = api_events(resource);
        if events.is_empty() || has_invoke_permission(resources, function) {
            continue;
        }

        let api = events
            .iter()
            .find_map(|event| {
                event
                    .get("Properties")
                    .and_then(|properties| properties.get("RestApiId"))
                    .and_then(ref_target)
            })
            .unwrap_or(DEFAULT_REST_API);

        let mut properties = Mapping::new();
        properties.insert("Action".into(), INVOKE_ACTION.into());
        properties.insert("FunctionName".into(), make_ref(function));
        properties.insert("Principal".into(), "apigateway.amazonaws.com".into());
        properties.insert(
            "SourceArn".into(),
            tagged(
                "Sub",
                Value::String(format!(
                    "arn:aws:execute-api:${{AWS::Region}}:${{AWS::AccountId}}:${{{api}}}/*/*/*"
                )),
            ),
        );
        let mut permission = Mapping::new();
        permission.insert("Type".into(), PERMISSION_TYPE.into());
        permission.insert("Properties".into(), Value::Mapping(properties));

        additions.push((format!("{function}ApiInvokePermission"), permission));
    }

    for (name, permission) in additions {
        debug!("Adding invoke permission {}", name);
        resources.insert(Value::String(name), Value::Mapping(permission));
    }
}

fn as_policy_list(policies: Option<Value>) -> Vec<Value> {
    match policies {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(list)) => list,
        Some(single) => vec![single],
    }
}

/// Move `Globals.Function.Policies` into every function's own policy list.
///
/// A global policy document with a `Statement` is merged into the
/// function's own document, other entries are appended.
pub fn merge_global_policies(template: &mut Value, path: &Path) -> Result<()> {
    let Some(globals) = template
        .get_mut("Globals")
        .and_then(|globals| globals.get_mut("Function"))
        .and_then(Value::as_mapping_mut)
    else {
        return Ok(());
    };
    let Some(policies) = globals.remove("Policies") else {
        return Ok(());
    };
    let Value::Sequence(policies) = policies else {
        return Err(SamError::invalid_template(
            path,
            "Globals.Function.Policies is not a list",
        ));
    };

    let (statements, others): (Vec<Value>, Vec<Value>) = policies
        .into_iter()
        .partition(|policy| policy.get("Statement").is_some());
    let global_statements: Vec<Value> = statements
        .into_iter()
        .flat_map(|document| as_policy_list(document.get("Statement").cloned()))
        .collect();

    let Some(resources) = template.get_mut("Resources").and_then(Value::as_mapping_mut) else {
        return Ok(());
    };
    for resource in resources.values_mut() {
        if resource_type(resource) != Some(FUNCTION_TYPE) {
            continue;
        }
        let Some(properties) = resource.get_mut("Properties").and_then(Value::as_mapping_mut)
        else {
            continue;
        };

        let mut own = as_policy_list(properties.remove("Policies"));
        if !global_statements.is_empty() {
            let document = own
                .iter_mut()
                .find_map(|policy| policy.get_mut("Statement").and_then(Value::as_sequence_mut));
            match document {
                Some(statement) => statement.extend(global_statements.iter().cloned()),
                None => {
                    let mut document = Mapping::new();
                    document.insert(
                        "Statement".into(),
                        Value::Sequence(global_statements.clone()),
                    );
                    own.push(Value::Mapping(document));
                }
            }
        }
        own.extend(others.iter().cloned());
        properties.insert("Policies".into(), Value::Sequence(own));
    }
    Ok(())
}

/// Thread a deployment marker resource through every resource's
/// dependencies and expose the tag as an output
pub fn add_marker_tag(template: &mut Value, tag: &str) {
    let Some(root) = template.as_mapping_mut() else {
        return;
    };
    let suffix: String = tag.chars().filter(char::is_ascii_alphanumeric).collect();
    let marker = format!("DeploymentMarkerTag{suffix}");

    if let Some(resources) = child_mapping(root, "Resources") {
        for resource in resources.values_mut() {
            let Some(resource) = resource.as_mapping_mut() else {
                continue;
            };
            let depends_on = match resource.remove("DependsOn") {
                None => Value::String(marker.clone()),
                Some(Value::Sequence(mut list)) => {
                    list.push(Value::String(marker.clone()));
                    Value::Sequence(list)
                }
                Some(single) => Value::Sequence(vec![single, Value::String(marker.clone())]),
            };
            resource.insert("DependsOn".into(), depends_on);
        }

        let mut handle = Mapping::new();
        handle.insert(
            "Type".into(),
            "AWS::CloudFormation::WaitConditionHandle".into(),
        );
        resources.insert(Value::String(marker), Value::Mapping(handle));
    }

    if let Some(outputs) = child_mapping(root, "Outputs") {
        let mut output = Mapping::new();
        output.insert("Description".into(), "Deployment History Tag".into());
        output.insert("Value".into(), tag.into());
        outputs.insert("DeploymentHistoryTag".into(), Value::Mapping(output));
    }
}

/// Replace the environment placeholders used by environment-aware templates
pub fn substitute_placeholders(text: &str, environment: &str, dev_stack: &str) -> String {
    text.replace("<EnvironmentName>", environment)
        .replace("<DevStack>", dev_stack)
}

/// Apply placeholder substitution to every string parameter default
pub fn substitute_parameter_defaults(parameters: &mut Mapping, environment: &str, dev_stack: &str) {
    for parameter in parameters.values_mut() {
        let Some(parameter) = parameter.as_mapping_mut() else {
            continue;
        };
        if let Some(Value::String(default)) = parameter.get_mut("Default") {
            *default = substitute_placeholders(default, environment, dev_stack);
        }
    }
}

/// Overlay stack and environment names from the configuration onto the
/// matching declared parameters
pub fn apply_config_defaults(template: &mut Value, config: &SamConfig) {
    let Some(parameters) = template.get_mut("Parameters").and_then(Value::as_mapping_mut) else {
        return;
    };

    let overlays = [
        ("StackTagName", config.base_stack()),
        ("StackName", config.base_stack()),
        ("EnvironmentTagName", config.environment()),
        ("EnvironmentName", config.environment()),
        ("DevStackName", config.dev_stack()),
    ];
    for (name, value) in overlays {
        let Some(value) = value else {
            continue;
        };
        if let Some(parameter) = parameters.get_mut(name).and_then(Value::as_mapping_mut) {
            parameter.insert("Default".into(), value.into());
        }
    }
}
