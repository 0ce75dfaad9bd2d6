// File event routing between functions, layers and layer libraries
use proptest::prelude::*;
use samwatch_core::events::LayerChange;
use samwatch_core::manifest::PackageManifest;
use samwatch_core::paths::relative_to;
use samwatch_core::sam::{classify_dependencies, LocalDependency, TemplateReconciler};
use samwatch_core::toolchain::ToolchainCall;
use samwatch_test_helpers::fixtures::SampleProject;
use samwatch_test_helpers::mocks::{mock_container, MockEnvironment, SAMPLE_STACK};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

fn loaded(project: &SampleProject) -> (MockEnvironment, Arc<TemplateReconciler>) {
    let env = mock_container(project);
    let reconciler =
        TemplateReconciler::new(Path::new("template.yml"), env.ctx.clone(), SAMPLE_STACK, false);
    reconciler.reload().expect("initial reload");
    (env, reconciler)
}

fn compiled_projects(env: &MockEnvironment) -> Vec<PathBuf> {
    env.toolchain
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ToolchainCall::Compile(request) => Some(request.project_dir),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Owner selection
// ============================================================================

#[test]
fn test_library_change_reaches_only_the_library() {
    let project = SampleProject::new();
    let (env, reconciler) = loaded(&project);
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    reconciler
        .layer_change()
        .subscribe(move |change: &LayerChange| sink.lock().unwrap().push(change.layer.clone()));
    env.toolchain.clear_calls();

    project.touch("src/library/index.ts");
    reconciler
        .file_event(Path::new("src/library/index.ts"))
        .unwrap();

    assert_eq!(compiled_projects(&env), vec![project.path("src/library")]);
    assert_eq!(*changes.lock().unwrap(), vec!["DependencyLayer".to_string()]);
    assert!(env.cloud.updates().is_empty());
}

#[test]
fn test_sibling_prefix_is_not_an_owner() {
    let project = SampleProject::new();
    project.write("src/function10/index.ts", "export {}\n");
    let (env, reconciler) = loaded(&project);
    env.toolchain.clear_calls();

    project.touch("src/function10/index.ts");
    reconciler
        .file_event(Path::new("src/function10/index.ts"))
        .unwrap();

    assert!(compiled_projects(&env).is_empty());
}

#[test]
fn test_build_output_changes_are_ignored() {
    let project = SampleProject::new();
    let (env, reconciler) = loaded(&project);
    env.toolchain.clear_calls();

    project.write("src/library/dist/index.js", "exports.greet = () => 'hello';\n");
    reconciler
        .file_event(Path::new("src/library/dist/index.js"))
        .unwrap();
    project.write("src/function1/node_modules/left-pad/index.js", "");
    reconciler
        .file_event(Path::new("src/function1/node_modules/left-pad/index.js"))
        .unwrap();

    assert!(compiled_projects(&env).is_empty());
}

#[test]
fn test_layer_manifest_change_reconciles_layer() {
    let project = SampleProject::new();
    let (env, reconciler) = loaded(&project);
    let changes = Arc::new(Mutex::new(0usize));
    let sink = changes.clone();
    reconciler.layer_change().subscribe(move |_| *sink.lock().unwrap() += 1);

    project.write(
        "layers/dependencies/nodejs/package.json",
        r#"{ "dependencies": { "left-pad": "^1.3.0", "uuid": "^9.0.0" } }"#,
    );
    reconciler
        .file_event(Path::new("layers/dependencies/nodejs/package.json"))
        .unwrap();

    assert_eq!(*changes.lock().unwrap(), 1);
    let layer = reconciler.layer("DependencyLayer").unwrap();
    assert!(layer.libs().is_empty(), "dropped library should be released");
    let written = PackageManifest::load(
        &project.build_path("layers/dependencies/nodejs/package.json"),
    )
    .unwrap();
    assert!(written.dependencies.contains_key("uuid"));
    assert!(env
        .toolchain
        .calls()
        .iter()
        .any(|call| matches!(call, ToolchainCall::Install { dir, .. }
            if dir == &project.build_path("layers/dependencies/nodejs"))));
}

// ============================================================================
// Dependency classification and manifest synthesis
// ============================================================================

#[test]
fn test_only_local_references_become_libraries() {
    let project = SampleProject::empty();
    project.write(
        "layers/shared/package.json",
        r#"{ "dependencies": { "lib": "file:../lib", "left-pad": "^1.3.0" } }"#,
    );
    let manifest = PackageManifest::load(&project.path("layers/shared/package.json")).unwrap();

    let dependencies =
        classify_dependencies(&manifest, &project.path("layers/shared"), project.root());

    assert_eq!(
        dependencies,
        vec![LocalDependency::InRepo {
            name: "lib".to_string(),
            path: PathBuf::from("layers/lib"),
        }]
    );
}

#[test]
fn test_synthesized_layer_manifest_points_at_library_mirror() {
    let project = SampleProject::new();
    let (_env, _reconciler) = loaded(&project);

    let written = PackageManifest::load(
        &project.build_path("layers/dependencies/nodejs/package.json"),
    )
    .unwrap();
    let local: Vec<_> = written.local_dependencies().collect();
    assert_eq!(local.len(), 1);
    let (name, target) = local[0];
    assert_eq!(name, "library");
    assert_eq!(target, project.build_path("src/library"));
    assert!(target.join("dist/index.js").exists());
    assert!(target.join("package.json").exists());
}

// ============================================================================
// Prefix matching properties
// ============================================================================

proptest! {
    #[test]
    fn test_owner_prefix_routes_nested_paths(
        owner in prop::collection::vec("[a-z]{1,6}", 1..4),
        rest in prop::collection::vec("[a-z]{1,6}", 1..4),
    ) {
        let owner: PathBuf = owner.iter().collect();
        let rest: PathBuf = rest.iter().collect();
        let changed = owner.join(&rest);
        prop_assert_eq!(relative_to(&changed, &owner), Some(rest));
    }

    #[test]
    fn test_textual_prefix_without_separator_does_not_route(
        owner in "[a-z]{1,6}",
        suffix in "[a-z0-9]{1,4}",
        file in "[a-z]{1,6}",
    ) {
        let owner = PathBuf::from("src").join(&owner);
        let sibling = PathBuf::from(format!("{}{}", owner.display(), suffix)).join(file);
        prop_assert_eq!(relative_to(&sibling, &owner), None);
    }
}
