//! Path arithmetic shared by the reconciler and its entities
//!
//! All entity paths are project-relative. Routing uses component-wise prefix
//! matching (`src/fn` owns `src/fn/index.ts` but not `src/fn2/index.ts`).

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Dependency cache folder maintained by the package manager
pub const MODULES_DIR: &str = "node_modules";

/// Package manifest file name
pub const MANIFEST_FILE: &str = "package.json";

/// Package lockfile name
pub const LOCKFILE: &str = "package-lock.json";

/// Compiler configuration file name
pub const COMPILER_CONFIG_FILE: &str = "tsconfig.json";

/// Lexically normalize a path, folding `.` and `..` components
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = match out.components().next_back() {
                    Some(Component::Normal(_)) => out.pop(),
                    _ => false,
                };
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path of `path` relative to `owner`, if `owner` is a component-wise prefix
pub fn relative_to(path: &Path, owner: &Path) -> Option<PathBuf> {
    normalize(path)
        .strip_prefix(normalize(owner))
        .ok()
        .map(Path::to_path_buf)
}

/// Relative path from directory `from` to `to`; both must be absolute or
/// both relative to the same base.
pub fn diff_paths(to: &Path, from: &Path) -> PathBuf {
    let to = normalize(to);
    let from = normalize(from);
    let to_parts: Vec<_> = to.components().collect();
    let from_parts: Vec<_> = from.components().collect();

    let common = to_parts
        .iter()
        .zip(from_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from_parts.len() {
        out.push("..");
    }
    for part in &to_parts[common..] {
        out.push(part.as_os_str());
    }
    out
}

/// Filesystem-safe flattening of a project-relative path (`src/fn` -> `src-fn`)
pub fn path_smash(path: &Path) -> String {
    let text = path.to_string_lossy();
    let trimmed = text.strip_prefix("./").unwrap_or(&text);
    trimmed.replace(['/', '\\'], "-")
}

/// True if the relative path names a package manifest (at any depth)
pub fn is_manifest(relative: &Path) -> bool {
    relative.file_name().map(|n| n == MANIFEST_FILE).unwrap_or(false)
}

/// True if any component of the path is the dependency cache folder
pub fn in_modules_dir(relative: &Path) -> bool {
    relative.components().any(|c| c.as_os_str() == MODULES_DIR)
}

/// Recursively copy `src` into `dest`, skipping entries rejected by `keep`.
///
/// `keep` receives the path relative to `src` and whether it is a directory;
/// rejecting a directory prunes its whole subtree. Existing files are
/// replaced.
pub fn copy_tree<F>(src: &Path, dest: &Path, keep: F) -> io::Result<usize>
where
    F: Fn(&Path, bool) -> bool,
{
    fs::create_dir_all(dest)?;
    let mut copied = 0;

    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|entry| {
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        keep(relative, entry.file_type().is_dir())
    });

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if target.exists() {
                fs::remove_file(&target)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}
