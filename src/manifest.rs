use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AbcError;
use crate::fsys::Fs;
use crate::pathutil;

/// Reserved directory holding an installation's manifest, directly under
/// the installation root.
pub const INTERNAL_DIR: &str = ".abc";

/// Latest manifest header values written on every render and upgrade.
pub const API_VERSION_LATEST: &str = "abc/v1";
pub const KIND_MANIFEST: &str = "TemplateManifest";

/// Comment line prepended to every marshaled manifest.
pub const DO_NOT_MODIFY_HEADER: &str = "# Generated by abc. DO NOT MODIFY.";

/// Where a template was sourced from. Only `local_git` installations
/// participate in inter-manifest dependency edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    LocalGit,
    RemoteGit,
    #[serde(other)]
    Other,
}

/// One input replayed into the renderer on upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputValue {
    pub name: String,
    pub value: String,
}

/// One rendered output file. `patch` is present iff the file was produced
/// by an include-from-destination edit; it holds the unified diff that
/// turns the edited file back into the pre-edit content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// Record of one template installation, stored under
/// `<install_root>/.abc/manifest*.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(alias = "apiVersion")]
    pub api_version: String,
    pub kind: String,

    pub creation_time: DateTime<Utc>,
    pub modification_time: DateTime<Utc>,

    #[serde(default)]
    pub template_location: String,
    pub location_type: LocationType,
    #[serde(default)]
    pub template_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_channel: Option<String>,
    pub template_dirhash: String,

    #[serde(default)]
    pub inputs: Vec<InputValue>,
    #[serde(default)]
    pub output_files: Vec<OutputFile>,
}

/// Load a manifest and return it alongside the raw bytes.
///
/// The raw bytes are kept for filter evaluation, which decodes them as a
/// dynamic mapping so user expressions see the file as written rather than
/// the migrated struct.
pub fn load_manifest(path: &Path) -> Result<(Manifest, Vec<u8>), AbcError> {
    let raw = fs::read(path).map_err(|e| AbcError::Filesystem {
        path: path.to_path_buf(),
        source: e,
    })?;
    let manifest: Manifest =
        serde_yaml::from_slice(&raw).map_err(|e| AbcError::MalformedManifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    validate(path, &manifest)?;
    Ok((manifest, raw))
}

fn validate(path: &Path, m: &Manifest) -> Result<(), AbcError> {
    let malformed = |reason: String| AbcError::MalformedManifest {
        path: path.to_path_buf(),
        reason,
    };

    if m.creation_time > m.modification_time {
        return Err(malformed(format!(
            "creation_time {} is after modification_time {}",
            m.creation_time, m.modification_time
        )));
    }

    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for f in &m.output_files {
        if !pathutil::is_safe_rel(&f.path) {
            return Err(malformed(format!("unsafe output path {:?}", f.path)));
        }
        if !seen.insert(&f.path) {
            return Err(malformed(format!("duplicate output path {:?}", f.path)));
        }
    }
    Ok(())
}

/// Per-file hash lookup for a manifest's outputs.
pub fn hashes_as_map(files: &[OutputFile]) -> BTreeMap<String, String> {
    files
        .iter()
        .map(|f| (f.path.clone(), f.hash.clone()))
        .collect()
}

/// Installation root for a manifest path: the grandparent directory
/// (`<root>/.abc/manifest.yaml` → `<root>`).
pub fn install_root(manifest_path: &Path) -> Option<&Path> {
    manifest_path.parent().and_then(|p| p.parent())
}

/// Marshal a manifest with the do-not-modify header and replace `path`
/// atomically (write-new-then-rename in the same directory).
pub fn save_manifest(fs: &dyn Fs, path: &Path, m: &Manifest) -> Result<(), AbcError> {
    let body = serde_yaml::to_string(m)?;
    let content = format!("{DO_NOT_MODIFY_HEADER}\n{body}");

    let file_name = path
        .file_name()
        .ok_or_else(|| AbcError::MalformedManifest {
            path: path.to_path_buf(),
            reason: "manifest path has no file name".into(),
        })?
        .to_string_lossy()
        .to_string();
    let tmp: PathBuf = path.with_file_name(format!("{file_name}.tmp"));

    fs.write(&tmp, content.as_bytes())
        .map_err(|e| AbcError::Filesystem {
            path: tmp.clone(),
            source: e,
        })?;
    fs.rename(&tmp, path).map_err(|e| AbcError::Filesystem {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}
