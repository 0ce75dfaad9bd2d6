// Watch-mode pipeline driven by file events on the sample project
use indoc::indoc;
use samwatch_core::cloud::MockCloudClient;
use samwatch_core::config::CliOverrides;
use samwatch_core::framework::{Framework, RunMode};
use samwatch_test_helpers::fixtures::SampleProject;
use samwatch_test_helpers::mocks::{
    mock_container, mock_container_with, sample_stack_resources, SAMPLE_STACK,
};
use std::path::Path;

fn sam_commands(invocations: &[Vec<String>]) -> Vec<&str> {
    invocations
        .iter()
        .filter_map(|args| args.first().map(String::as_str))
        .collect()
}

#[test]
fn test_watch_load_builds_then_deploys_once() {
    let project = SampleProject::new();
    let env = mock_container(&project);
    let framework = Framework::new(Path::new("template.yml"), env.ctx.clone());
    assert_eq!(framework.mode(), RunMode::Watch);

    framework.load().unwrap();

    let invocations = env.toolchain.sam_invocations();
    assert_eq!(sam_commands(&invocations), vec!["build", "deploy"]);
    let deploy = &invocations[1];
    assert!(deploy.contains(&"StackName=sample".to_string()));
    assert!(deploy.contains(&"EnvironmentTagName=dev".to_string()));
    assert!(deploy.contains(&"TableName=orders-<EnvironmentName>".to_string()));
    assert!(!framework.run_pending().unwrap());
}

#[test]
fn test_layer_manifest_change_queues_one_deploy() {
    let project = SampleProject::new();
    let env = mock_container(&project);
    let framework = Framework::new(Path::new("template.yml"), env.ctx.clone());
    framework.load().unwrap();
    env.toolchain.clear_calls();

    project.touch("layers/dependencies/nodejs/package.json");
    framework
        .file_event(Path::new("layers/dependencies/nodejs/package.json"))
        .unwrap();

    assert!(framework.run_pending().unwrap());
    assert_eq!(
        sam_commands(&env.toolchain.sam_invocations()),
        vec!["build", "deploy"]
    );
    assert!(!framework.run_pending().unwrap());
}

#[test]
fn test_function_source_change_skips_the_pipeline() {
    let project = SampleProject::new();
    let env = mock_container(&project);
    let framework = Framework::new(Path::new("template.yml"), env.ctx.clone());
    framework.load().unwrap();
    env.toolchain.clear_calls();

    project.touch("src/function2/index.ts");
    framework
        .file_event(Path::new("src/function2/index.ts"))
        .unwrap();

    assert!(!framework.run_pending().unwrap());
    assert!(env.toolchain.sam_invocations().is_empty());
    assert_eq!(env.cloud.updates().len(), 1);
}

#[test]
fn test_template_edit_triggers_pipeline() {
    let project = SampleProject::new();
    let env = mock_container(&project);
    let framework = Framework::new(Path::new("template.yml"), env.ctx.clone());
    framework.load().unwrap();
    env.toolchain.clear_calls();

    let edited = project.read("template.yml").replace("nodejs18.x", "nodejs20.x");
    project.write("template.yml", &edited);
    project.touch("template.yml");
    framework.file_event(Path::new("template.yml")).unwrap();

    assert!(framework.run_pending().unwrap());
    let written = std::fs::read_to_string(project.build_path("template.yml")).unwrap();
    assert!(written.contains("nodejs20.x"));
}

#[test]
fn test_include_paths_are_mirrored() {
    let project = SampleProject::new();
    project.write("statemachines/orders.asl.json", r#"{ "StartAt": "A" }"#);
    let env = mock_container_with(
        &project,
        CliOverrides::new()
            .with("include", "statemachines")
            .with("skip_init_deploy", "true"),
        MockCloudClient::new().with_stack(SAMPLE_STACK, sample_stack_resources()),
    );
    let framework = Framework::new(Path::new("template.yml"), env.ctx.clone());
    framework.load().unwrap();
    assert!(project
        .build_path("statemachines/orders.asl.json")
        .exists());
    assert!(env.toolchain.sam_invocations().is_empty());

    project.write("statemachines/orders.asl.json", r#"{ "StartAt": "B" }"#);
    framework
        .file_event(Path::new("statemachines/orders.asl.json"))
        .unwrap();

    let mirrored =
        std::fs::read_to_string(project.build_path("statemachines/orders.asl.json")).unwrap();
    assert!(mirrored.contains("\"B\""));
    assert!(framework.run_pending().unwrap());
}

#[test]
fn test_cleanup_stops_queueing() {
    let project = SampleProject::new();
    let env = mock_container(&project);
    let framework = Framework::new(Path::new("template.yml"), env.ctx.clone());
    framework.load().unwrap();

    framework.cleanup();

    assert!(framework.template().functions().is_empty());
    assert_eq!(framework.template().layer_change().listener_count(), 0);
    assert_eq!(framework.template().template_update().listener_count(), 0);
}

#[test]
fn test_deploy_without_environment_passes_resolved_layer() {
    let project = SampleProject::empty();
    project.write(
        "samconfig.toml",
        "[default.deploy.parameters]\nstack_name = \"orders-explicit\"\nparm_layer = \"true\"\n",
    );
    project.write(
        "template.yml",
        indoc! {"
            Parameters:
              CommonLayer:
                Type: AWS::SSM::Parameter::Value<String>
                Default: /layers/common
            Resources:
              Orders:
                Type: AWS::Serverless::Function
                Properties:
                  CodeUri: src/orders
                  FunctionName: orders-fn
                  Layers:
                    - !Ref CommonLayer
        "},
    );
    project.write("src/orders/tsconfig.json", "{}");
    project.write("src/orders/index.ts", "export const handler = async () => 1;\n");
    let env = mock_container_with(
        &project,
        CliOverrides::new(),
        MockCloudClient::new().with_parameter("/layers/common", "arn:layer:common:7"),
    );
    let framework = Framework::new(Path::new("template.yml"), env.ctx.clone());

    framework.load().unwrap();

    let invocations = env.toolchain.sam_invocations();
    assert_eq!(sam_commands(&invocations), vec!["build", "deploy"]);
    let deploy = &invocations[1];
    assert!(deploy.contains(&"CommonLayer=arn:layer:common:7".to_string()));
    assert!(!deploy.iter().any(|arg| arg.contains("/layers/common")));
    assert!(!deploy.iter().any(|arg| arg.starts_with("StackName=")));
    let written = std::fs::read_to_string(project.build_path("template.yml")).unwrap();
    assert!(written.contains("arn:layer:common:7"));
}
