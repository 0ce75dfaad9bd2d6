//! Test fixtures - scaffolded sample projects on disk

use indoc::indoc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub const SAMCONFIG: &str = indoc! {r#"
    version = 0.1

    [default.deploy.parameters]
    base_stack = "sample"
    environment = "dev"
    region = "us-east-1"

    [prod.deploy.parameters]
    region = "us-west-2"
"#};

pub const TEMPLATE: &str = indoc! {"
    AWSTemplateFormatVersion: '2010-09-09'
    Transform: AWS::Serverless-2016-10-31
    Parameters:
      StackTagName:
        Type: String
      EnvironmentTagName:
        Type: String
      TableName:
        Type: String
        Default: orders-<EnvironmentName>
    Globals:
      Function:
        Runtime: nodejs18.x
        Handler: index.handler
    Resources:
      Function1:
        Type: AWS::Serverless::Function
        Properties:
          CodeUri: src/function1
          Layers:
            - !Ref DependencyLayer
      Function2:
        Type: AWS::Serverless::Function
        Properties:
          CodeUri: src/function2
          FunctionName: sample-function2
      DependencyLayer:
        Type: AWS::Serverless::LayerVersion
        Properties:
          ContentUri: layers/dependencies
"};

/// Template with `Function2` removed
pub const TEMPLATE_WITHOUT_FUNCTION2: &str = indoc! {"
    Resources:
      Function1:
        Type: AWS::Serverless::Function
        Properties:
          CodeUri: src/function1
      DependencyLayer:
        Type: AWS::Serverless::LayerVersion
        Properties:
          ContentUri: layers/dependencies
"};

const FUNCTION_TSCONFIG: &str = r#"{ "compilerOptions": { "target": "es2019" } }"#;

const LIBRARY_TSCONFIG: &str =
    r#"{ "compilerOptions": { "outDir": "dist", "declaration": true } }"#;

/// A scaffolded project: two functions, one layer and one in-repo library
/// the layer and the first function depend on
pub struct SampleProject {
    dir: TempDir,
    clock: AtomicU64,
}

impl SampleProject {
    pub fn new() -> Self {
        let project = Self::empty();
        project.write("samconfig.toml", SAMCONFIG);
        project.write("template.yml", TEMPLATE);

        project.write("src/function1/tsconfig.json", FUNCTION_TSCONFIG);
        project.write(
            "src/function1/index.ts",
            "import { greet } from 'library';\nexport const handler = async () => greet();\n",
        );
        project.write("src/function1/config.json", r#"{ "retries": 3 }"#);
        project.write(
            "src/function1/package.json",
            r#"{
  "name": "function1",
  "dependencies": {
    "library": "file:../library",
    "left-pad": "^1.3.0"
  }
}"#,
        );

        project.write("src/function2/tsconfig.json", FUNCTION_TSCONFIG);
        project.write("src/function2/index.ts", "export const handler = async () => 2;\n");

        project.write("src/library/tsconfig.json", LIBRARY_TSCONFIG);
        project.write("src/library/index.ts", "export const greet = () => 'hello';\n");
        project.write(
            "src/library/package.json",
            r#"{ "name": "library", "main": "dist/index.js" }"#,
        );

        project.write(
            "layers/dependencies/nodejs/package.json",
            r#"{
  "name": "dependencies",
  "dependencies": {
    "library": "file:../../../src/library",
    "left-pad": "^1.3.0"
  }
}"#,
        );
        project
    }

    /// A temp directory with nothing in it
    pub fn empty() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
            clock: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    /// Build-root mirror of a project-relative path
    pub fn build_path(&self, relative: &str) -> PathBuf {
        self.root().join(".build/root").join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write fixture file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.path(relative)).expect("read fixture file")
    }

    pub fn remove(&self, relative: &str) {
        fs::remove_file(self.path(relative)).expect("remove fixture file");
    }

    /// Move a file's modification time forward, later than any previous
    /// touch, so fingerprints see a change regardless of timer resolution
    pub fn touch(&self, relative: &str) {
        let step = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let modified = SystemTime::now() + Duration::from_secs(10 * step);
        fs::File::options()
            .write(true)
            .open(self.path(relative))
            .expect("open fixture file")
            .set_modified(modified)
            .expect("set modification time");
    }
}

impl Default for SampleProject {
    fn default() -> Self {
        Self::new()
    }
}
