use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::{fingerprint_dir, Result, CACHE_DIR_NAME};
use crate::paths::path_smash;

/// Remembers the last clean fingerprint of every tracked path
pub struct FingerprintCache {
    /// Project root; tracked paths are relative to it
    root: PathBuf,

    /// Directory holding one durable file per tracked path
    cache_dir: PathBuf,

    /// Fingerprints loaded or written during this process
    entries: Mutex<FxHashMap<PathBuf, String>>,
}

impl FingerprintCache {
    /// Create a cache rooted at `root`, persisting under `root/.build/hash`
    pub fn new(root: &Path) -> Self {
        Self::with_cache_dir(root, root.join(CACHE_DIR_NAME))
    }

    pub fn with_cache_dir(root: &Path, cache_dir: PathBuf) -> Self {
        Self {
            root: root.to_path_buf(),
            cache_dir,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Durable cache file for a tracked path
    pub fn cache_file(&self, path: &Path) -> PathBuf {
        self.cache_dir.join(path_smash(path))
    }

    /// Current fingerprint of a tracked path
    pub fn fingerprint(&self, path: &Path) -> Result<String> {
        fingerprint_dir(&self.root.join(path))
    }

    fn remembered(&self, path: &Path) -> Option<String> {
        if let Some(known) = self.lock().get(path) {
            return Some(known.clone());
        }

        let file = self.cache_file(path);
        match std::fs::read_to_string(&file) {
            Ok(content) => {
                self.lock().insert(path.to_path_buf(), content.clone());
                Some(content)
            }
            Err(_) => None,
        }
    }

    /// True if the path changed since it was last marked clean.
    ///
    /// A path that has never been marked clean (in this process or a
    /// previous one) is always stale.
    pub fn is_stale(&self, path: &Path) -> Result<bool> {
        let Some(known) = self.remembered(path) else {
            debug!("No fingerprint recorded for {:?}", path);
            return Ok(true);
        };

        let current = self.fingerprint(path)?;
        Ok(current != known)
    }

    /// Record the current fingerprint in memory and on disk.
    ///
    /// Only call this after a successful build.
    pub fn mark_clean(&self, path: &Path) -> Result<()> {
        let current = self.fingerprint(path)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(self.cache_file(path), &current)?;
        self.lock().insert(path.to_path_buf(), current);
        Ok(())
    }

    /// Record the current fingerprint in memory only, leaving the durable
    /// entry untouched
    pub fn mark_clean_in_memory(&self, path: &Path) -> Result<()> {
        let current = self.fingerprint(path)?;
        self.lock().insert(path.to_path_buf(), current);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<PathBuf, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("Fingerprint cache lock was poisoned, continuing");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn project() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("src/function1")).unwrap();
        fs::write(temp_dir.path().join("src/function1/index.ts"), "x").unwrap();
        temp_dir
    }

    fn touch_later(path: &Path) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(30))
            .unwrap();
    }

    #[test]
    fn test_never_seen_path_is_stale() {
        let temp_dir = project();
        let cache = FingerprintCache::new(temp_dir.path());

        assert!(cache.is_stale(Path::new("src/function1")).unwrap());
    }

    #[test]
    fn test_mark_clean_then_not_stale() {
        let temp_dir = project();
        let cache = FingerprintCache::new(temp_dir.path());
        let path = Path::new("src/function1");

        cache.mark_clean(path).unwrap();

        assert!(!cache.is_stale(path).unwrap());
        assert!(temp_dir.path().join(".build/hash/src-function1").exists());
    }

    #[test]
    fn test_modification_makes_path_stale_again() {
        let temp_dir = project();
        let cache = FingerprintCache::new(temp_dir.path());
        let path = Path::new("src/function1");

        cache.mark_clean(path).unwrap();
        touch_later(&temp_dir.path().join("src/function1/index.ts"));

        assert!(cache.is_stale(path).unwrap());
    }

    #[test]
    fn test_durable_entry_survives_restart() {
        let temp_dir = project();
        let path = Path::new("src/function1");

        FingerprintCache::new(temp_dir.path()).mark_clean(path).unwrap();
        let restarted = FingerprintCache::new(temp_dir.path());

        assert!(!restarted.is_stale(path).unwrap());
    }

    #[test]
    fn test_in_memory_mark_does_not_persist() {
        let temp_dir = project();
        let path = Path::new("src/function1");

        let cache = FingerprintCache::new(temp_dir.path());
        cache.mark_clean_in_memory(path).unwrap();
        assert!(!cache.is_stale(path).unwrap());
        assert!(!cache.cache_file(path).exists());

        let restarted = FingerprintCache::new(temp_dir.path());
        assert!(restarted.is_stale(path).unwrap());
    }
}
