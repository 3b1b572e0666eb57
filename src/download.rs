use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context as _};
use serde::Serialize;
use walkdir::WalkDir;

use crate::manifest::LocationType;
use crate::pathutil;

/// Version string recorded when the template source carries no usable
/// version information.
pub const UNVERSIONED: &str = "(unversioned)";

/// What the pipeline asks a downloader to fetch.
#[derive(Debug)]
pub struct DownloadRequest<'a> {
    /// Installation root; relative canonical locations resolve against it.
    pub installed_dir: &'a Path,
    pub canonical_location: &'a str,
    pub location_type: LocationType,
    pub git_protocol: &'a str,
    /// Requested version: an override, the manifest's upgrade channel, or
    /// `latest`.
    pub version: &'a str,
}

/// What a downloader reports back once `dest` is populated.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadMetadata {
    pub canonical_location: String,
    pub location_type: LocationType,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_channel: Option<String>,
    /// Source facts templates may interpolate (`git_sha`, `git_tag`, ...).
    pub vars: BTreeMap<String, String>,
}

/// Resolves a template source and populates a directory with it.
///
/// Errors are plain `anyhow` here; the pipeline wraps them with the
/// manifest being processed.
pub trait Downloader {
    fn download(
        &self,
        req: &DownloadRequest<'_>,
        dest: &Path,
    ) -> Result<DownloadMetadata, anyhow::Error>;
}

/// Downloader for template sources on the local filesystem, optionally
/// inside a git work tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDownloader;

impl Downloader for LocalDownloader {
    fn download(
        &self,
        req: &DownloadRequest<'_>,
        dest: &Path,
    ) -> Result<DownloadMetadata, anyhow::Error> {
        let loc = req.canonical_location;
        if loc.contains("://") || loc.starts_with("git@") {
            bail!("remote template location {loc:?} is not supported by the local downloader");
        }

        let src = if Path::new(loc).is_absolute() {
            PathBuf::from(loc)
        } else {
            pathutil::lexical_normalize(&req.installed_dir.join(loc))
        };
        if !src.is_dir() {
            bail!("template source {} does not exist", src.display());
        }

        copy_tree(&src, dest)?;

        let git = GitFacts::probe(&src);
        let version = git
            .sha
            .clone()
            .unwrap_or_else(|| UNVERSIONED.to_string());
        let location_type = if git.sha.is_some() {
            LocationType::LocalGit
        } else {
            req.location_type
        };
        let upgrade_channel = if req.version == "latest" {
            None
        } else {
            Some(req.version.to_string())
        };

        let mut vars = BTreeMap::new();
        if let Some(sha) = &git.sha {
            vars.insert("git_sha".to_string(), sha.clone());
        }
        if let Some(tag) = &git.tag {
            vars.insert("git_tag".to_string(), tag.clone());
        }

        Ok(DownloadMetadata {
            canonical_location: loc.to_string(),
            location_type,
            version,
            upgrade_channel,
            vars,
        })
    }
}

/// Copy a template tree, skipping `.git/`.
fn copy_tree(src: &Path, dest: &Path) -> Result<(), anyhow::Error> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walking {}", src.display()))?;
        let rel = match pathutil::rel_str(src, entry.path()) {
            Some(r) if !r.is_empty() => r,
            _ => continue,
        };
        if rel == ".git" || rel.starts_with(".git/") {
            continue;
        }
        let target = dest.join(&rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating {}", target.display()))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!("copying {} to {}", entry.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct GitFacts {
    sha: Option<String>,
    tag: Option<String>,
}

impl GitFacts {
    /// Best-effort: a missing git binary or a non-repo source is not an
    /// error, just an unversioned template.
    fn probe(src: &Path) -> Self {
        let run = |args: &[&str]| -> Option<String> {
            let out = Command::new("git")
                .arg("-C")
                .arg(src)
                .args(args)
                .output()
                .ok()?;
            if !out.status.success() {
                return None;
            }
            let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
            (!s.is_empty()).then_some(s)
        };

        GitFacts {
            sha: run(&["rev-parse", "HEAD"]),
            tag: run(&["describe", "--tags", "--exact-match", "HEAD"]),
        }
    }
}
