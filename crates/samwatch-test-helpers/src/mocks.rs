//! Mock collaborators wired into a container for testing

use std::sync::Arc;

use samwatch_core::cloud::{MockCloudClient, StackResource};
use samwatch_core::config::{CliOverrides, EnvOverrides, SamConfig};
use samwatch_core::di::Container;
use samwatch_core::toolchain::MockToolchain;

use crate::fixtures::SampleProject;

/// Stack name the sample configuration resolves to
pub const SAMPLE_STACK: &str = "sample-dev";

/// Physical name the sample stack gives `Function1`
pub const FUNCTION1_PHYSICAL: &str = "sample-dev-Function1-A1B2C3";

/// A container plus handles on its recording collaborators
pub struct MockEnvironment {
    pub ctx: Arc<Container>,
    pub toolchain: Arc<MockToolchain>,
    pub cloud: Arc<MockCloudClient>,
}

/// Live resources of the deployed sample stack
pub fn sample_stack_resources() -> Vec<StackResource> {
    vec![
        StackResource::new("Function1", FUNCTION1_PHYSICAL, "AWS::Lambda::Function"),
        StackResource::new("Function2", "sample-function2", "AWS::Lambda::Function"),
        StackResource::new(
            "DependencyLayer",
            "arn:aws:lambda:us-east-1:123456789012:layer:sample-dev-DependencyLayer:1",
            "AWS::Lambda::LayerVersion",
        ),
    ]
}

/// Container over the sample project with the deployed sample stack
pub fn mock_container(project: &SampleProject) -> MockEnvironment {
    mock_container_with(
        project,
        CliOverrides::new(),
        MockCloudClient::new().with_stack(SAMPLE_STACK, sample_stack_resources()),
    )
}

pub fn mock_container_with(
    project: &SampleProject,
    flags: CliOverrides,
    cloud: MockCloudClient,
) -> MockEnvironment {
    let config = SamConfig::load(project.root(), &flags, &EnvOverrides::default())
        .expect("load sample configuration");
    let toolchain = Arc::new(MockToolchain::new());
    let cloud = Arc::new(cloud);
    let ctx = Arc::new(Container::with_dependencies(
        project.root(),
        config,
        toolchain.clone(),
        cloud.clone(),
    ));
    MockEnvironment {
        ctx,
        toolchain,
        cloud,
    }
}
