use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::AbcError;
use crate::manifest::INTERNAL_DIR;
use crate::pathutil;

/// Walk `root` for installation manifests.
///
/// A path counts iff its basename starts with `manifest`, its extension is
/// `.yaml`, and it sits directly inside a `.abc` directory. Returned paths
/// are relative to `root` and sorted; a nonexistent root yields an empty
/// list (the driver turns that into `NoManifestsFound`).
pub fn crawl_manifests(root: &Path) -> Result<Vec<PathBuf>, AbcError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(|e| AbcError::Filesystem {
            path: root.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        let in_internal_dir = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n == INTERNAL_DIR)
            .unwrap_or(false);
        let name_matches = path
            .file_stem()
            .map(|s| s.to_string_lossy().starts_with("manifest"))
            .unwrap_or(false);
        let ext_matches = path.extension().map(|e| e == "yaml").unwrap_or(false);

        if in_internal_dir && name_matches && ext_matches {
            if let Some(rel) = pathutil::rel_str(root, path) {
                found.push(PathBuf::from(rel));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Evaluate a user filter expression against a manifest's raw YAML.
///
/// The raw bytes are decoded as a dynamic mapping (not the parsed struct),
/// so the expression sees exactly the fields as written and api-version
/// migration cannot shift them. Top-level keys become variables. An empty
/// expression selects everything; a non-boolean result is an error.
pub fn matches_filter(expr: &str, raw: &[u8]) -> Result<bool, AbcError> {
    if expr.trim().is_empty() {
        return Ok(true);
    }

    let ctx: serde_yaml::Value = serde_yaml::from_slice(raw)
        .map_err(|e| AbcError::FilterExpr(format!("manifest is not valid YAML: {e}")))?;
    if !ctx.is_mapping() {
        return Err(AbcError::FilterExpr(
            "manifest document is not a mapping".into(),
        ));
    }

    let env = minijinja::Environment::new();
    let compiled = env
        .compile_expression(expr)
        .map_err(|e| AbcError::FilterExpr(e.to_string()))?;
    let result = compiled
        .eval(&ctx)
        .map_err(|e| AbcError::FilterExpr(e.to_string()))?;

    if result.kind() != minijinja::value::ValueKind::Bool {
        return Err(AbcError::FilterExpr(format!(
            "expression {expr:?} must evaluate to a boolean, got {}",
            result.kind()
        )));
    }
    Ok(result.is_true())
}
