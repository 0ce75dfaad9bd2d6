//! Cloud provider calls used as leaf I/O
//!
//! [`AwsCliClient`] drives the `aws` command line tool with JSON output;
//! [`MockCloudClient`] records calls for tests.

use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::process::Command;
use std::sync::Mutex;
use tracing::debug;

use crate::errors::{Result, SamError};

/// One deployed resource of a stack
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackResource {
    pub logical_resource_id: String,
    #[serde(default)]
    pub physical_resource_id: String,
    #[serde(default)]
    pub resource_type: String,
}

impl StackResource {
    pub fn new(logical: &str, physical: &str, resource_type: &str) -> Self {
        Self {
            logical_resource_id: logical.to_string(),
            physical_resource_id: physical.to_string(),
            resource_type: resource_type.to_string(),
        }
    }
}

/// A resolved parameter-store value
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParameterValue {
    pub name: String,
    pub value: String,
}

pub trait CloudClient: Send + Sync {
    /// Every resource of a deployed stack (all pages)
    fn list_stack_resources(&self, stack_name: &str) -> Result<Vec<StackResource>>;

    /// Replace a deployed function's code package
    fn update_function_code(&self, function_name: &str, zip: &[u8]) -> Result<()>;

    /// Batch-resolve parameter-store values; unknown names are omitted
    fn get_parameters(&self, names: &[String]) -> Result<Vec<ParameterValue>>;
}

/// Cloud client backed by the `aws` command line tool
#[derive(Debug, Clone, Default)]
pub struct AwsCliClient {
    region: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListStackResourcesOutput {
    #[serde(default)]
    stack_resource_summaries: Vec<StackResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetParametersOutput {
    #[serde(default)]
    parameters: Vec<ParameterValue>,
}

impl AwsCliClient {
    pub fn new(region: Option<String>) -> Self {
        Self { region }
    }

    fn run(&self, operation: &str, args: &[&str]) -> Result<Vec<u8>> {
        let mut command = Command::new("aws");
        command.args(args).args(["--output", "json"]);
        if let Some(region) = &self.region {
            command.args(["--region", region]);
        }
        debug!("aws {}", args.join(" "));

        let output = command
            .output()
            .map_err(|e| SamError::cloud(operation, e.to_string()))?;
        if !output.status.success() {
            return Err(SamError::cloud(
                operation,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(output.stdout)
    }
}

impl CloudClient for AwsCliClient {
    fn list_stack_resources(&self, stack_name: &str) -> Result<Vec<StackResource>> {
        // The CLI follows NextToken itself and merges every page
        let stdout = self.run(
            "ListStackResources",
            &["cloudformation", "list-stack-resources", "--stack-name", stack_name],
        )?;
        let parsed: ListStackResourcesOutput = serde_json::from_slice(&stdout)?;
        Ok(parsed.stack_resource_summaries)
    }

    fn update_function_code(&self, function_name: &str, zip: &[u8]) -> Result<()> {
        let mut staged = tempfile::Builder::new().suffix(".zip").tempfile()?;
        staged.write_all(zip)?;
        staged.flush()?;
        let zip_arg = format!("fileb://{}", staged.path().display());

        self.run(
            "UpdateFunctionCode",
            &[
                "lambda",
                "update-function-code",
                "--function-name",
                function_name,
                "--zip-file",
                &zip_arg,
            ],
        )?;
        Ok(())
    }

    fn get_parameters(&self, names: &[String]) -> Result<Vec<ParameterValue>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["ssm", "get-parameters", "--names"];
        args.extend(names.iter().map(String::as_str));
        let stdout = self.run("GetParameters", &args)?;
        let parsed: GetParametersOutput = serde_json::from_slice(&stdout)?;
        Ok(parsed.parameters)
    }
}

/// A recorded code update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUpdate {
    pub function_name: String,
    pub zip: Vec<u8>,
}

/// In-memory cloud with canned stacks and parameters
#[derive(Debug, Default)]
pub struct MockCloudClient {
    stacks: Mutex<HashMap<String, Vec<StackResource>>>,
    parameters: Mutex<HashMap<String, String>>,
    updates: Mutex<Vec<CodeUpdate>>,
    failing_functions: Mutex<Vec<String>>,
    list_calls: Mutex<Vec<String>>,
}

impl MockCloudClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack(self, stack_name: &str, resources: Vec<StackResource>) -> Self {
        if let Ok(mut stacks) = self.stacks.lock() {
            stacks.insert(stack_name.to_string(), resources);
        }
        self
    }

    pub fn with_parameter(self, name: &str, value: &str) -> Self {
        if let Ok(mut parameters) = self.parameters.lock() {
            parameters.insert(name.to_string(), value.to_string());
        }
        self
    }

    /// Make code updates for this physical function name fail
    pub fn fail_updates_for(&self, function_name: &str) {
        if let Ok(mut failing) = self.failing_functions.lock() {
            failing.push(function_name.to_string());
        }
    }

    pub fn updates(&self) -> Vec<CodeUpdate> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn listed_stacks(&self) -> Vec<String> {
        self.list_calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CloudClient for MockCloudClient {
    fn list_stack_resources(&self, stack_name: &str) -> Result<Vec<StackResource>> {
        if let Ok(mut calls) = self.list_calls.lock() {
            calls.push(stack_name.to_string());
        }
        self.stacks
            .lock()
            .ok()
            .and_then(|stacks| stacks.get(stack_name).cloned())
            .ok_or_else(|| {
                SamError::cloud(
                    "ListStackResources",
                    format!("Stack with id {stack_name} does not exist"),
                )
            })
    }

    fn update_function_code(&self, function_name: &str, zip: &[u8]) -> Result<()> {
        let failing = self
            .failing_functions
            .lock()
            .map(|f| f.iter().any(|name| name == function_name))
            .unwrap_or(false);
        if failing {
            return Err(SamError::cloud(
                "UpdateFunctionCode",
                format!("Function not found: {function_name}"),
            ));
        }
        if let Ok(mut updates) = self.updates.lock() {
            updates.push(CodeUpdate {
                function_name: function_name.to_string(),
                zip: zip.to_vec(),
            });
        }
        Ok(())
    }

    fn get_parameters(&self, names: &[String]) -> Result<Vec<ParameterValue>> {
        let parameters = self
            .parameters
            .lock()
            .map_err(|e| SamError::cloud("GetParameters", e.to_string()))?;
        Ok(names
            .iter()
            .filter_map(|name| {
                parameters.get(name).map(|value| ParameterValue {
                    name: name.clone(),
                    value: value.clone(),
                })
            })
            .collect())
    }
}
