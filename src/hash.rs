use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::AbcError;
use crate::fsys::Fs;
use crate::pathutil;

/// Algorithm tag for SHA-256 content hashes. Hash strings look like
/// `h1:<base64 of the 32 digest bytes>`.
pub const ALGO_SHA256: &str = "h1";

/// Outcome of comparing a file on disk against an expected hash.
///
/// `Absent` means the file does not exist; any other I/O failure while
/// opening or reading is fatal and surfaces as an error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashResult {
    Match,
    Mismatch,
    Absent,
}

/// Stream a reader through SHA-256. Never loads the content whole.
fn digest_reader(r: &mut dyn Read) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    io::copy(r, &mut hasher)?;
    Ok(hasher.finalize().into())
}

fn tag(digest: [u8; 32]) -> String {
    format!("{}:{}", ALGO_SHA256, BASE64.encode(digest))
}

/// Compute the tagged content hash of a file.
pub fn file_hash(path: &Path) -> Result<String, AbcError> {
    let mut fh = File::open(path).map_err(|e| AbcError::Filesystem {
        path: path.to_path_buf(),
        source: e,
    })?;
    let digest = digest_reader(&mut fh).map_err(|e| AbcError::Filesystem {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(tag(digest))
}

/// Hash `path` and compare against the tagged hash `want`.
pub fn hash_and_compare(fs: &dyn Fs, path: &Path, want: &str) -> Result<HashResult, AbcError> {
    let (algo, b64) = want
        .split_once(':')
        .ok_or_else(|| anyhow!("hash {want:?} is missing an algorithm tag"))?;
    if algo != ALGO_SHA256 {
        return Err(anyhow!("unknown hash algorithm {algo:?} in {want:?}").into());
    }
    let want_bytes = BASE64
        .decode(b64)
        .map_err(|e| anyhow!("undecodable hash {want:?}: {e}"))?;

    let mut rdr = match fs.open(path) {
        Ok(r) => r,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashResult::Absent),
        Err(e) => {
            return Err(AbcError::Filesystem {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    let digest = digest_reader(&mut rdr).map_err(|e| AbcError::Filesystem {
        path: path.to_path_buf(),
        source: e,
    })?;

    if digest[..] == want_bytes[..] {
        Ok(HashResult::Match)
    } else {
        Ok(HashResult::Mismatch)
    }
}

/// Aggregate hash over every file in a directory tree.
///
/// One line per file, `"<file-hash>  <rel-path>\n"` sorted by relative path
/// with `/` separators, then SHA-256 over the concatenation. Stable across
/// platforms and directory enumeration order.
pub fn dir_hash(root: &Path) -> Result<String, AbcError> {
    let mut lines: Vec<String> = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| AbcError::Filesystem {
            path: root.to_path_buf(),
            source: io::Error::other(e.to_string()),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = pathutil::rel_str(root, entry.path()).ok_or_else(|| {
            anyhow!(
                "walked path {} escapes root {}",
                entry.path().display(),
                root.display()
            )
        })?;
        let h = file_hash(entry.path())?;
        lines.push(format!("{h}  {rel}\n"));
    }
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    Ok(tag(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsys::RealFs;
    use std::fs;

    /// Tagged hash of a byte string, for expectations.
    fn hash_of(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        tag(hasher.finalize().into())
    }

    #[test]
    fn test_file_hash_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("f.txt");
        fs::write(&p, b"some contents\n").unwrap();

        let got = file_hash(&p).unwrap();
        assert_eq!(got, hash_of(b"some contents\n"));
        assert!(got.starts_with("h1:"));

        assert_eq!(
            hash_and_compare(&RealFs, &p, &got).unwrap(),
            HashResult::Match
        );
    }

    #[test]
    fn test_hash_and_compare_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("f.txt");
        fs::write(&p, b"one thing").unwrap();

        let other = hash_of(b"another thing");
        assert_eq!(
            hash_and_compare(&RealFs, &p, &other).unwrap(),
            HashResult::Mismatch
        );
    }

    #[test]
    fn test_hash_and_compare_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("missing.txt");
        assert_eq!(
            hash_and_compare(&RealFs, &p, &hash_of(b"x")).unwrap(),
            HashResult::Absent
        );
    }

    #[test]
    fn test_hash_and_compare_unknown_algo() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("f.txt");
        fs::write(&p, b"x").unwrap();
        assert!(hash_and_compare(&RealFs, &p, "md5:abcd").is_err());
        assert!(hash_and_compare(&RealFs, &p, "no-tag-here").is_err());
    }

    #[test]
    fn test_dir_hash_stable_across_creation_order() {
        let mk = |names: &[&str]| {
            let tmp = tempfile::tempdir().unwrap();
            for n in names {
                let p = tmp.path().join(n);
                fs::create_dir_all(p.parent().unwrap()).unwrap();
                fs::write(&p, format!("content of {n}")).unwrap();
            }
            (dir_hash(tmp.path()).unwrap(), tmp)
        };

        let (h1, _t1) = mk(&["a.txt", "sub/b.txt", "sub/c.txt"]);
        let (h2, _t2) = mk(&["sub/c.txt", "a.txt", "sub/b.txt"]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_dir_hash_sees_content_change() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), "v1").unwrap();
        let before = dir_hash(tmp.path()).unwrap();
        fs::write(tmp.path().join("a.txt"), "v2").unwrap();
        let after = dir_hash(tmp.path()).unwrap();
        assert_ne!(before, after);
    }
}
