use std::path::PathBuf;

use crate::error::AbcError;

/// Owns every temporary directory created for one upgrade attempt.
///
/// Dropping the tracker removes the directories on all exit paths,
/// including errors and panics. With `keep` set they are persisted instead
/// and their locations printed, so a failed upgrade can be inspected.
#[derive(Debug)]
pub struct TempDirTracker {
    keep: bool,
    dirs: Vec<tempfile::TempDir>,
}

impl TempDirTracker {
    pub fn new(keep: bool) -> Self {
        Self {
            keep,
            dirs: Vec::new(),
        }
    }

    /// Create a fresh temp directory and track it for cleanup.
    pub fn create(&mut self, prefix: &str) -> Result<PathBuf, AbcError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("abc-{prefix}-"))
            .tempdir()?;
        let path = dir.path().to_path_buf();
        self.dirs.push(dir);
        Ok(path)
    }
}

impl Drop for TempDirTracker {
    fn drop(&mut self) {
        if !self.keep {
            // TempDir's own Drop removes each directory.
            return;
        }
        for dir in self.dirs.drain(..) {
            let path = dir.keep();
            eprintln!("keeping temp dir: {}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_on_drop() {
        let path;
        {
            let mut tracker = TempDirTracker::new(false);
            path = tracker.create("test").unwrap();
            assert!(path.is_dir());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_removed_on_panic() {
        use std::panic;

        let path = std::sync::Arc::new(std::sync::Mutex::new(None));
        let path2 = path.clone();
        let _ = panic::catch_unwind(move || {
            let mut tracker = TempDirTracker::new(false);
            *path2.lock().unwrap() = Some(tracker.create("test").unwrap());
            panic!("boom");
        });
        let p = path.lock().unwrap().clone().unwrap();
        assert!(!p.exists());
    }

    #[test]
    fn test_kept_when_requested() {
        let path;
        {
            let mut tracker = TempDirTracker::new(true);
            path = tracker.create("test").unwrap();
        }
        assert!(path.is_dir());
        std::fs::remove_dir_all(&path).unwrap();
    }
}
