use std::fs;
use std::io::{self, Read};
use std::path::Path;

use chrono::{DateTime, Utc};

/// Cooperative cancellation flag, checked between manifests and between
/// files. The CLI wires SIGINT to it; in-flight work is left to finish.
pub type CancelFlag = std::sync::Arc<std::sync::atomic::AtomicBool>;

/// Clock seam so tests can pin the upgrade moment.
pub trait Clock {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Filesystem seam for the upgrade engine.
///
/// Everything that mutates an installation directory (the merge executor,
/// the reversal stage, the manifest writer) goes through this trait, so
/// tests can substitute an implementation that injects faults.
pub trait Fs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
}

/// The real thing: thin passthrough to `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl Fs for RealFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        fs::write(path, data)
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realfs_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let f = RealFs;
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("sub/b.txt");

        f.write(&a, b"hello").unwrap();
        assert!(f.exists(&a));
        assert_eq!(f.read(&a).unwrap(), b"hello");

        f.create_dir_all(b.parent().unwrap()).unwrap();
        f.copy(&a, &b).unwrap();
        assert_eq!(f.read(&b).unwrap(), b"hello");

        let c = tmp.path().join("c.txt");
        f.rename(&a, &c).unwrap();
        assert!(!f.exists(&a));

        f.remove_file(&c).unwrap();
        assert!(!f.exists(&c));
    }

    #[test]
    fn test_realfs_open_missing() {
        let f = RealFs;
        match f.open(Path::new("/nonexistent/abc-test-file")) {
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::NotFound),
            Ok(_) => panic!("expected an error"),
        }
    }
}
