//! External compiler, package manager, archiver and deploy tool
//!
//! The core never compiles, installs or deploys by itself; it asks a
//! [`Toolchain`]. [`ProcessToolchain`] shells out to the real tools and
//! [`MockToolchain`] simulates them for tests.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, error};
use walkdir::WalkDir;

use crate::errors::{Result, SamError};
use crate::paths::{in_modules_dir, COMPILER_CONFIG_FILE, MODULES_DIR};

/// How the package manager should install dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Everything, including development dependencies (source tree)
    Development,
    /// Runtime dependencies only (build-root mirrors)
    Production,
    /// Runtime dependencies pinned by a captured lockfile
    Reproducible,
}

/// One invocation of the compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    /// Directory holding the governing compiler configuration
    pub project_dir: PathBuf,
    /// Output directory override; `None` uses the configuration's own
    pub out_dir: Option<PathBuf>,
    /// Emit type declarations alongside the code
    pub declarations: bool,
}

pub trait Toolchain: Send + Sync {
    fn compile(&self, request: &CompileRequest) -> Result<()>;
    fn install(&self, dir: &Path, mode: InstallMode) -> Result<()>;
    /// Zip the contents of `source_dir` (not the directory itself) into `dest`
    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<()>;
    /// Run the infrastructure build/deploy tool
    fn sam(&self, args: &[String], cwd: &Path) -> Result<()>;
}

/// Runs the real command-line tools
#[derive(Debug, Default)]
pub struct ProcessToolchain;

impl ProcessToolchain {
    pub fn new() -> Self {
        Self
    }

    /// Run with captured output, only showing it when the command fails
    fn run_quiet(program: &str, args: &[&str], cwd: &Path) -> Result<()> {
        let command_line = format!("{} {}", program, args.join(" "));
        debug!("Running `{}` in {:?}", command_line, cwd);

        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| SamError::command_failed(&command_line, e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("`{}` failed\n{}{}", command_line, stdout, stderr);
        Err(SamError::command_failed(
            command_line,
            format!("exit status {}", output.status),
        ))
    }

    fn run_inherited(program: &str, args: &[String], cwd: &Path) -> Result<()> {
        let command_line = format!("{} {}", program, args.join(" "));
        debug!("Running `{}` in {:?}", command_line, cwd);

        let status = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .status()
            .map_err(|e| SamError::command_failed(&command_line, e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(SamError::command_failed(
                command_line,
                format!("exit status {status}"),
            ))
        }
    }
}

impl Toolchain for ProcessToolchain {
    fn compile(&self, request: &CompileRequest) -> Result<()> {
        let mut args = vec!["tsc", "-p", "."];
        if request.declarations {
            args.push("-d");
        }
        let out_dir = request
            .out_dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().to_string());
        if let Some(out_dir) = &out_dir {
            std::fs::create_dir_all(out_dir)?;
            args.push("--outDir");
            args.push(out_dir);
        }
        Self::run_quiet("npx", &args, &request.project_dir)
    }

    fn install(&self, dir: &Path, mode: InstallMode) -> Result<()> {
        let args: &[&str] = match mode {
            InstallMode::Development => &["i"],
            InstallMode::Production => &["i", "--only=prod"],
            InstallMode::Reproducible => &["ci", "--only=prod"],
        };
        Self::run_quiet("npm", args, dir)
    }

    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<()> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest = dest.to_string_lossy();
        Self::run_quiet("zip", &["-qr", &dest, "."], source_dir)
    }

    fn sam(&self, args: &[String], cwd: &Path) -> Result<()> {
        Self::run_inherited("sam", args, cwd)
    }
}

/// A recorded toolchain invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainCall {
    Compile(CompileRequest),
    Install { dir: PathBuf, mode: InstallMode },
    Archive { source: PathBuf, dest: PathBuf },
    Sam { args: Vec<String>, cwd: PathBuf },
}

/// In-process stand-in for the real tools.
///
/// Compiling copies every `.ts` file to a `.js` file (plus a `.d.ts` when
/// declarations are requested), installing creates a `node_modules` folder,
/// and archiving writes a sorted listing of the archived files.
#[derive(Debug, Default)]
pub struct MockToolchain {
    calls: Mutex<Vec<ToolchainCall>>,
    failing_compiles: Mutex<Vec<PathBuf>>,
}

impl MockToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ToolchainCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    pub fn compile_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ToolchainCall::Compile(_)))
            .count()
    }

    pub fn sam_invocations(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ToolchainCall::Sam { args, .. } => Some(args),
                _ => None,
            })
            .collect()
    }

    /// Make every compile under `project_dir` fail until cleared
    pub fn fail_compiles_in(&self, project_dir: &Path) {
        if let Ok(mut failing) = self.failing_compiles.lock() {
            failing.push(project_dir.to_path_buf());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut failing) = self.failing_compiles.lock() {
            failing.clear();
        }
    }

    fn record(&self, call: ToolchainCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn configured_out_dir(project_dir: &Path) -> Option<PathBuf> {
        let content = std::fs::read_to_string(project_dir.join(COMPILER_CONFIG_FILE)).ok()?;
        let config: serde_json::Value = serde_json::from_str(&content).ok()?;
        config["compilerOptions"]["outDir"]
            .as_str()
            .map(|dir| project_dir.join(dir))
    }
}

impl Toolchain for MockToolchain {
    fn compile(&self, request: &CompileRequest) -> Result<()> {
        self.record(ToolchainCall::Compile(request.clone()));

        let failing = self
            .failing_compiles
            .lock()
            .map(|f| f.iter().any(|dir| request.project_dir.starts_with(dir)))
            .unwrap_or(false);
        if failing {
            return Err(SamError::command_failed("tsc", "simulated compile error"));
        }

        let out_dir = request
            .out_dir
            .clone()
            .or_else(|| Self::configured_out_dir(&request.project_dir))
            .unwrap_or_else(|| request.project_dir.clone());
        let local_out = Self::configured_out_dir(&request.project_dir);

        for entry in WalkDir::new(&request.project_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            let Ok(relative) = path.strip_prefix(&request.project_dir) else {
                continue;
            };
            if in_modules_dir(relative)
                || local_out.as_ref().is_some_and(|dir| path.starts_with(dir))
                || path.starts_with(&out_dir) && out_dir != request.project_dir
            {
                continue;
            }
            let is_source = path.extension().is_some_and(|ext| ext == "ts")
                && !path.to_string_lossy().ends_with(".d.ts");
            if !entry.file_type().is_file() || !is_source {
                continue;
            }

            let target = out_dir.join(relative).with_extension("js");
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(path, &target)?;
            if request.declarations {
                std::fs::copy(path, target.with_extension("d.ts"))?;
            }
        }
        Ok(())
    }

    fn install(&self, dir: &Path, mode: InstallMode) -> Result<()> {
        self.record(ToolchainCall::Install {
            dir: dir.to_path_buf(),
            mode,
        });
        std::fs::create_dir_all(dir.join(MODULES_DIR))?;
        Ok(())
    }

    fn archive(&self, source_dir: &Path, dest: &Path) -> Result<()> {
        self.record(ToolchainCall::Archive {
            source: source_dir.to_path_buf(),
            dest: dest.to_path_buf(),
        });

        let mut listing: Vec<String> = WalkDir::new(source_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(source_dir)
                    .ok()
                    .map(|p| p.to_string_lossy().to_string())
            })
            .collect();
        listing.sort();

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, listing.join("\n"))?;
        Ok(())
    }

    fn sam(&self, args: &[String], cwd: &Path) -> Result<()> {
        self.record(ToolchainCall::Sam {
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
        });
        Ok(())
    }
}
