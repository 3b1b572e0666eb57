use std::path::{Component, Path, PathBuf};

use crate::error::AbcError;

/// Returns true if `rel` is a plain relative path: no root, no drive prefix,
/// and no `..` traversal anywhere.
pub fn is_safe_rel(rel: &str) -> bool {
    if rel.is_empty() {
        return false;
    }
    Path::new(rel).components().all(|c| match c {
        Component::Normal(_) | Component::CurDir => true,
        Component::ParentDir | Component::RootDir | Component::Prefix(_) => false,
    })
}

/// Join a manifest-relative path onto `base`, refusing traversal outside it.
pub fn safe_join(base: &Path, rel: &str) -> Result<PathBuf, AbcError> {
    if !is_safe_rel(rel) {
        return Err(AbcError::MalformedManifest {
            path: base.to_path_buf(),
            reason: format!("unsafe relative path {rel:?}"),
        });
    }
    Ok(base.join(rel))
}

/// Collapse `.` and `..` components without touching the filesystem.
///
/// Purely lexical so equality checks work on paths that may not exist yet.
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `/..` is `/`; leading `..`s accumulate.
                Some(Component::RootDir) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Relative path of `path` under `root` as a string with forward slashes.
///
/// Normalizing the separator keeps manifest entries and merge reports stable
/// across platforms.
pub fn rel_str(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}
