//! Classification of template resources into the kinds the reconciler acts on

use indexmap::IndexMap;
use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

pub const FUNCTION_TYPE: &str = "AWS::Serverless::Function";
pub const LAYER_TYPE: &str = "AWS::Serverless::LayerVersion";
pub const APPLICATION_TYPE: &str = "AWS::Serverless::Application";
pub const PERMISSION_TYPE: &str = "AWS::Lambda::Permission";

/// Parameter type resolved from the parameter store at deploy time
pub const SSM_PARAMETER_TYPE: &str = "AWS::SSM::Parameter::Value<String>";

/// A deployable function declaration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionDecl {
    /// Local code path; `None` when absent or not a plain path
    pub code_uri: Option<PathBuf>,
    /// Explicit physical name, trimmed
    pub function_name: Option<String>,
    /// Raw `Layers` entries
    pub layers: Vec<Value>,
    /// Declared with `InlineCode`; nothing to compile
    pub inline: bool,
}

impl FunctionDecl {
    pub fn from_properties(properties: Option<&Value>) -> Self {
        let Some(properties) = properties else {
            return Self::default();
        };
        Self {
            code_uri: properties
                .get("CodeUri")
                .and_then(Value::as_str)
                .map(|uri| PathBuf::from(uri.trim_start_matches("./"))),
            function_name: properties
                .get("FunctionName")
                .and_then(Value::as_str)
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
            layers: properties
                .get("Layers")
                .and_then(Value::as_sequence)
                .cloned()
                .unwrap_or_default(),
            inline: properties.get("InlineCode").is_some(),
        }
    }

    /// Own code path, falling back to the template-wide default
    pub fn effective_code_uri(&self, global: Option<&Path>) -> Option<PathBuf> {
        self.code_uri
            .clone()
            .or_else(|| global.map(Path::to_path_buf))
    }
}

/// A shared layer declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerDecl {
    pub content_uri: PathBuf,
    pub layer_name: Option<String>,
    pub build_method: Option<String>,
}

impl LayerDecl {
    fn parse(resource: &Value) -> Option<Self> {
        let properties = resource.get("Properties")?;
        let content_uri = properties.get("ContentUri")?.as_str()?;
        Some(Self {
            content_uri: PathBuf::from(content_uri.trim_start_matches("./")),
            layer_name: properties
                .get("LayerName")
                .and_then(Value::as_str)
                .map(str::to_string),
            build_method: resource
                .get("Metadata")
                .and_then(|metadata| metadata.get("BuildMethod"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}

/// A nested application backed by a local sub-template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NestedStackDecl {
    /// Sub-template location relative to the declaring template
    pub location: PathBuf,
    /// Parameters passed explicitly by the parent
    pub parameters: Mapping,
}

impl NestedStackDecl {
    fn parse(resource: &Value) -> Option<Self> {
        let properties = resource.get("Properties")?;
        let location = properties.get("Location")?.as_str()?;
        if location.contains("://") {
            return None;
        }
        Some(Self {
            location: PathBuf::from(location),
            parameters: properties
                .get("Parameters")
                .and_then(Value::as_mapping)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Closed set of resource kinds the reconciler understands
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Function(FunctionDecl),
    Layer(LayerDecl),
    NestedStack(NestedStackDecl),
    Other,
}

impl Resource {
    /// Classify one entry of the template's `Resources` map
    pub fn classify(resource: &Value) -> Self {
        match resource.get("Type").and_then(Value::as_str) {
            Some(FUNCTION_TYPE) => {
                Resource::Function(FunctionDecl::from_properties(resource.get("Properties")))
            }
            Some(LAYER_TYPE) => LayerDecl::parse(resource)
                .map(Resource::Layer)
                .unwrap_or(Resource::Other),
            Some(APPLICATION_TYPE) => NestedStackDecl::parse(resource)
                .map(Resource::NestedStack)
                .unwrap_or(Resource::Other),
            _ => Resource::Other,
        }
    }
}

/// Classify every resource of a parsed template, in declaration order
pub fn classify_resources(template: &Value) -> IndexMap<String, Resource> {
    template
        .get("Resources")
        .and_then(Value::as_mapping)
        .map(|resources| {
            resources
                .iter()
                .filter_map(|(key, value)| {
                    key.as_str()
                        .map(|name| (name.to_string(), Resource::classify(value)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Template-wide default code path (`Globals.Function.CodeUri`)
pub fn global_code_uri(template: &Value) -> Option<PathBuf> {
    global_function(template)?
        .get("CodeUri")
        .and_then(Value::as_str)
        .map(|uri| PathBuf::from(uri.trim_start_matches("./")))
}

/// `Globals.Function`, if declared
pub fn global_function(template: &Value) -> Option<&Value> {
    template.get("Globals")?.get("Function")
}

/// Target of a `Ref`, in either `!Ref Name` or `{ Ref: Name }` form
pub fn ref_target(value: &Value) -> Option<&str> {
    match value {
        Value::Tagged(tagged) if tagged.tag == "Ref" => tagged.value.as_str(),
        Value::Mapping(mapping) if mapping.len() == 1 => {
            mapping.get("Ref").and_then(Value::as_str)
        }
        _ => None,
    }
}

/// A `!Ref Name` node
pub fn make_ref(name: &str) -> Value {
    Value::Tagged(Box::new(TaggedValue {
        tag: Tag::new("Ref"),
        value: Value::String(name.to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_classify_known_kinds() {
        let template = parse(indoc! {r#"
            Resources:
              Orders:
                Type: AWS::Serverless::Function
                Properties:
                  CodeUri: ./src/orders
                  FunctionName: " orders-fn "
              Inline:
                Type: AWS::Serverless::Function
                Properties:
                  InlineCode: "exports.handler = async () => 1"
              Common:
                Type: AWS::Serverless::LayerVersion
                Properties:
                  ContentUri: src/layer
                Metadata:
                  BuildMethod: nodejs14.x
              Child:
                Type: AWS::Serverless::Application
                Properties:
                  Location: stacks/child.yml
              Remote:
                Type: AWS::Serverless::Application
                Properties:
                  Location: https://example.com/template.yml
              Bucket:
                Type: AWS::S3::Bucket
        "#});

        let resources = classify_resources(&template);
        let keys: Vec<_> = resources.keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["Orders", "Inline", "Common", "Child", "Remote", "Bucket"]
        );

        let Resource::Function(orders) = &resources["Orders"] else {
            panic!("expected function");
        };
        assert_eq!(orders.code_uri, Some(PathBuf::from("src/orders")));
        assert_eq!(orders.function_name.as_deref(), Some("orders-fn"));

        assert!(matches!(&resources["Inline"], Resource::Function(f) if f.inline));
        assert!(matches!(
            &resources["Common"],
            Resource::Layer(l) if l.build_method.as_deref() == Some("nodejs14.x")
        ));
        assert!(matches!(
            &resources["Child"],
            Resource::NestedStack(s) if s.location == Path::new("stacks/child.yml")
        ));
        assert_eq!(resources["Remote"], Resource::Other);
        assert_eq!(resources["Bucket"], Resource::Other);
    }

    #[test]
    fn test_global_code_uri_fallback() {
        let template = parse(indoc! {"
            Globals:
              Function:
                CodeUri: src/shared
            Resources: {}
        "});
        let global = global_code_uri(&template);
        assert_eq!(global, Some(PathBuf::from("src/shared")));

        let decl = FunctionDecl::default();
        assert_eq!(
            decl.effective_code_uri(global.as_deref()),
            Some(PathBuf::from("src/shared"))
        );
    }

    #[test]
    fn test_ref_forms() {
        let tagged = parse("!Ref LayerArn");
        let mapping = parse("Ref: LayerArn");
        let sub = parse("!Sub arn:${LayerArn}");

        assert_eq!(ref_target(&tagged), Some("LayerArn"));
        assert_eq!(ref_target(&mapping), Some("LayerArn"));
        assert_eq!(ref_target(&sub), None);
        assert_eq!(ref_target(&make_ref("LayerArn")), Some("LayerArn"));
    }

    #[test]
    fn test_ref_serializes_as_tag() {
        let out = serde_yaml::to_string(&make_ref("Param")).unwrap();
        assert_eq!(out.trim(), "!Ref Param");
    }
}
