use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use super::{CacheError, Result, IGNORED_DIRS};

/// Most recent modification time of any file under `path`.
///
/// Recurses into subdirectories but skips the generated-output and
/// dependency folders in [`IGNORED_DIRS`]. A plain file yields its own
/// mtime; an empty directory yields `None`.
pub fn latest_modified(path: &Path) -> Result<Option<SystemTime>> {
    if !path.exists() {
        return Err(CacheError::PathNotFound {
            path: path.to_path_buf(),
        });
    }

    let walker = WalkDir::new(path).into_iter().filter_entry(|entry| {
        // The root itself is never pruned, even if it is named `dist`
        entry.depth() == 0
            || !(entry.file_type().is_dir()
                && IGNORED_DIRS
                    .iter()
                    .any(|ignored| entry.file_name() == *ignored))
    });

    let mut latest: Option<SystemTime> = None;
    for entry in walker {
        let entry = entry.map_err(|e| CacheError::Walk {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(|e| CacheError::Walk {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            })?
            .modified()?;
        latest = Some(match latest {
            Some(current) if current >= modified => current,
            _ => modified,
        });
    }

    Ok(latest)
}

/// Canonical string form of a modification time, stable across processes
pub fn format_fingerprint(modified: Option<SystemTime>) -> String {
    match modified.and_then(|m| m.duration_since(UNIX_EPOCH).ok()) {
        Some(since_epoch) => format!(
            "{}.{:09}",
            since_epoch.as_secs(),
            since_epoch.subsec_nanos()
        ),
        None => "empty".to_string(),
    }
}

/// Fingerprint of a directory (or single file)
pub fn fingerprint_dir(path: &Path) -> Result<String> {
    Ok(format_fingerprint(latest_modified(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn test_fingerprint_consistency() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("index.ts"), "export const x = 1;").unwrap();

        let first = fingerprint_dir(temp_dir.path()).unwrap();
        let second = fingerprint_dir(temp_dir.path()).unwrap();

        assert_eq!(first, second, "Fingerprint should be consistent");
    }

    #[test]
    fn test_latest_modified_recurses_and_takes_maximum() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("lib/deep");
        fs::create_dir_all(&nested).unwrap();
        fs::write(temp_dir.path().join("a.ts"), "a").unwrap();
        fs::write(nested.join("b.ts"), "b").unwrap();

        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        set_mtime(&temp_dir.path().join("a.ts"), base);
        set_mtime(&nested.join("b.ts"), base + Duration::from_secs(60));

        let latest = latest_modified(temp_dir.path()).unwrap();
        assert_eq!(latest, Some(base + Duration::from_secs(60)));
    }

    #[test]
    fn test_generated_folders_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("dist")).unwrap();
        fs::create_dir_all(temp_dir.path().join("node_modules/left-pad")).unwrap();
        fs::write(temp_dir.path().join("index.ts"), "x").unwrap();
        fs::write(temp_dir.path().join("dist/index.js"), "x").unwrap();
        fs::write(temp_dir.path().join("node_modules/left-pad/index.js"), "x").unwrap();

        let base = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        set_mtime(&temp_dir.path().join("index.ts"), base);
        set_mtime(
            &temp_dir.path().join("dist/index.js"),
            base + Duration::from_secs(500),
        );
        set_mtime(
            &temp_dir.path().join("node_modules/left-pad/index.js"),
            base + Duration::from_secs(900),
        );

        assert_eq!(latest_modified(temp_dir.path()).unwrap(), Some(base));
    }

    #[test]
    fn test_empty_directory_fingerprint() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(fingerprint_dir(temp_dir.path()).unwrap(), "empty");
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = fingerprint_dir(&temp_dir.path().join("missing"));
        assert!(matches!(result, Err(CacheError::PathNotFound { .. })));
    }
}
