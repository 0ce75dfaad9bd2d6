//! Package manifests, lockfiles and compiler configuration files
//!
//! Local dependencies use the `file:` convention (`"lib": "file:../lib"`);
//! everything else is a registry dependency and is left untouched.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::Result;
use crate::paths::{COMPILER_CONFIG_FILE, MODULES_DIR};

/// Prefix marking a local path dependency
pub const FILE_PREFIX: &str = "file:";

/// A package manifest (`package.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(default)]
    pub dependencies: IndexMap<String, String>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl PackageManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// True if installing would fetch anything
    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Local (`file:`) dependencies as `(name, referenced path)`
    pub fn local_dependencies(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.dependencies.iter().filter_map(|(name, spec)| {
            spec.strip_prefix(FILE_PREFIX)
                .map(|reference| (name.as_str(), Path::new(reference)))
        })
    }

    /// Replace every local reference with the path returned by `rebase`
    pub fn rewrite_local<F>(&mut self, mut rebase: F)
    where
        F: FnMut(&str, &Path) -> PathBuf,
    {
        for (name, spec) in self.dependencies.iter_mut() {
            if let Some(reference) = spec.strip_prefix(FILE_PREFIX) {
                let rebased = rebase(name, Path::new(reference));
                *spec = format!("{}{}", FILE_PREFIX, rebased.display());
            }
        }
    }
}

/// A package lockfile, kept as raw JSON and patched in place
#[derive(Debug, Clone, PartialEq)]
pub struct Lockfile(Value);

impl Lockfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self(serde_json::from_str(&content)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(&self.0)?)?;
        Ok(())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Point the lock entries for `name` at a new `file:` reference
    pub fn patch_local(&mut self, name: &str, spec: &str) {
        if let Some(entry) = self
            .0
            .get_mut("dependencies")
            .and_then(|dependencies| dependencies.get_mut(name))
        {
            if entry.is_object() {
                entry["version"] = Value::String(spec.to_string());
            }
        }
        if let Some(root) = self.0.pointer_mut("/packages//dependencies") {
            if let Some(dep) = root.get_mut(name) {
                *dep = Value::String(spec.to_string());
            }
        }
        let installed = format!("{MODULES_DIR}/{name}");
        if let Some(entry) = self
            .0
            .get_mut("packages")
            .and_then(|packages| packages.get_mut(&installed))
        {
            if entry.get("resolved").is_some() {
                let resolved = spec.strip_prefix(FILE_PREFIX).unwrap_or(spec);
                entry["resolved"] = Value::String(resolved.to_string());
            }
        }
    }
}

/// A compiler configuration file (`tsconfig.json`)
#[derive(Debug, Clone)]
pub struct CompilerConfigFile {
    path: PathBuf,
    value: Value,
}

impl CompilerConfigFile {
    /// Load from a directory; unparseable files are treated as empty
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(COMPILER_CONFIG_FILE);
        let content = std::fs::read_to_string(&path)?;
        let value = serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("Could not parse {:?} ({}), using compiler defaults", path, e);
            Value::Null
        });
        Ok(Self { path, value })
    }

    /// Declared output directory, relative to the configuration's directory
    pub fn out_dir(&self) -> Option<PathBuf> {
        self.value
            .pointer("/compilerOptions/outDir")
            .and_then(Value::as_str)
            .map(|dir| PathBuf::from(dir.trim_start_matches("./").trim_end_matches('/')))
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Append the standard output/dependency exclusions; returns true if the
    /// file was rewritten
    pub fn ensure_excludes(&mut self) -> Result<bool> {
        let Some(out_dir) = self.out_dir() else {
            return Ok(false);
        };
        let Some(config) = self.value.as_object_mut() else {
            return Ok(false);
        };

        let wanted = [
            format!("{}/**/*", out_dir.display()),
            format!("{MODULES_DIR}/**/*"),
        ];
        let exclude = config
            .entry("exclude")
            .or_insert_with(|| Value::Array(Vec::new()));
        let Some(exclude) = exclude.as_array_mut() else {
            return Ok(false);
        };

        let mut changed = false;
        for pattern in wanted {
            if !exclude.iter().any(|e| e.as_str() == Some(pattern.as_str())) {
                exclude.push(Value::String(pattern));
                changed = true;
            }
        }

        if changed {
            std::fs::write(&self.path, serde_json::to_string_pretty(&self.value)?)?;
        }
        Ok(changed)
    }
}

/// Walk up from `start` (relative to `root`) to the nearest directory
/// holding a compiler configuration, never leaving the project
pub fn find_compiler_config_dir(root: &Path, start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if root.join(dir).join(COMPILER_CONFIG_FILE).exists() {
            return Some(dir.to_path_buf());
        }
        if dir.as_os_str().is_empty() {
            return None;
        }
        current = dir.parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_local_dependencies_only_file_references() {
        let manifest: PackageManifest = serde_json::from_str(
            r#"{"name":"layer","dependencies":{"lib":"file:../lib","left-pad":"^1.3.0"}}"#,
        )
        .unwrap();

        let locals: Vec<_> = manifest.local_dependencies().collect();
        assert_eq!(locals, vec![("lib", Path::new("../lib"))]);
        assert!(manifest.has_dependencies());
    }

    #[test]
    fn test_rewrite_local_preserves_registry_entries() {
        let mut manifest: PackageManifest = serde_json::from_str(
            r#"{"name":"fn","version":"1.0.0","dependencies":{"lib":"file:../lib","left-pad":"^1.3.0"}}"#,
        )
        .unwrap();

        manifest.rewrite_local(|_, reference| Path::new("/build/src").join(reference));

        assert_eq!(manifest.dependencies["lib"], "file:/build/src/../lib");
        assert_eq!(manifest.dependencies["left-pad"], "^1.3.0");
        assert_eq!(manifest.rest["version"], "1.0.0");
    }

    #[test]
    fn test_lockfile_patch_v1_and_v2_entries() {
        let mut lock = Lockfile(serde_json::json!({
            "lockfileVersion": 2,
            "packages": {
                "": { "dependencies": { "lib": "file:../lib" } },
                "node_modules/lib": { "resolved": "../lib", "link": true }
            },
            "dependencies": { "lib": { "version": "file:../lib" } }
        }));

        lock.patch_local("lib", "file:/abs/lib");

        let value = lock.as_value();
        assert_eq!(value["dependencies"]["lib"]["version"], "file:/abs/lib");
        assert_eq!(value["packages"][""]["dependencies"]["lib"], "file:/abs/lib");
        assert_eq!(value["packages"]["node_modules/lib"]["resolved"], "/abs/lib");
    }

    #[test]
    fn test_lockfile_patch_scoped_package() {
        let mut lock = Lockfile(serde_json::json!({
            "lockfileVersion": 1,
            "dependencies": {
                "@scope/lib": { "version": "file:../lib" },
                "plain": { "version": "file:../plain" }
            }
        }));

        lock.patch_local("@scope/lib", "file:../../lib");

        let value = lock.as_value();
        assert_eq!(value["dependencies"]["@scope/lib"]["version"], "file:../../lib");
        assert_eq!(value["dependencies"]["plain"]["version"], "file:../plain");
    }

    #[test]
    fn test_compiler_config_excludes_added_once() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("tsconfig.json"),
            r#"{"compilerOptions":{"outDir":"./dist/"}}"#,
        )
        .unwrap();

        let mut config = CompilerConfigFile::load(temp_dir.path()).unwrap();
        assert_eq!(config.out_dir(), Some(PathBuf::from("dist")));
        assert!(config.ensure_excludes().unwrap());

        let mut reloaded = CompilerConfigFile::load(temp_dir.path()).unwrap();
        assert!(!reloaded.ensure_excludes().unwrap());
        let raw = fs::read_to_string(temp_dir.path().join("tsconfig.json")).unwrap();
        assert!(raw.contains("dist/**/*"));
        assert!(raw.contains("node_modules/**/*"));
    }

    #[test]
    fn test_find_compiler_config_walks_up() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("src/functions/orders")).unwrap();
        fs::write(temp_dir.path().join("src/tsconfig.json"), "{}").unwrap();

        assert_eq!(
            find_compiler_config_dir(temp_dir.path(), Path::new("src/functions/orders")),
            Some(PathBuf::from("src"))
        );
        assert_eq!(
            find_compiler_config_dir(temp_dir.path(), Path::new("other")),
            None
        );
    }
}
