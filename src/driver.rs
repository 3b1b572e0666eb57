use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::crawl;
use crate::download::{DownloadMetadata, Downloader};
use crate::error::AbcError;
use crate::fsys::{CancelFlag, Clock, Fs};
use crate::graph::{self, GraphEntry};
use crate::inputs::Prompter;
use crate::manifest::{self, Manifest};
use crate::merge::ActionTaken;
use crate::pipeline;
use crate::render::Renderer;
use crate::reversal::ReversalConflict;

/// Severity-ordered outcome of one manifest (and, aggregated, of the run).
/// Only the two conflict kinds require the user's attention and halt the
/// driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    None,
    AlreadyUpToDate,
    Success,
    PatchReversalConflict,
    MergeConflict,
}

impl ResultType {
    pub fn requires_user_attention(&self) -> bool {
        matches!(
            self,
            ResultType::PatchReversalConflict | ResultType::MergeConflict
        )
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultType::None => "none",
            ResultType::AlreadyUpToDate => "already up to date",
            ResultType::Success => "success",
            ResultType::PatchReversalConflict => "patch reversal conflict",
            ResultType::MergeConflict => "merge conflict",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one manifest's upgrade attempt.
#[derive(Debug, Serialize)]
pub struct ManifestResult {
    /// Manifest path relative to the crawl root.
    pub manifest_path: PathBuf,
    #[serde(rename = "type")]
    pub result_type: ResultType,
    pub dl_meta: Option<DownloadMetadata>,
    pub non_conflicts: Vec<ActionTaken>,
    pub merge_conflicts: Vec<ActionTaken>,
    pub reversal_conflicts: Vec<ReversalConflict>,
    /// Manifests this one depends on in the upgrade order.
    pub depended_on: Vec<PathBuf>,
}

/// Run-level result: per-manifest outcomes in processing order, the
/// maximum severity across them, and the terminating error if any.
/// Completed manifests are preserved even when a later one fails.
#[derive(Debug, Serialize)]
pub struct UpgradeResult {
    pub overall: ResultType,
    pub results: Vec<ManifestResult>,
    #[serde(skip)]
    pub err: Option<AbcError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_manifest_path: Option<PathBuf>,
}

/// Everything one `upgrade_all` run needs: options plus injected services.
/// No global state; the filesystem, clock, downloader, renderer, and
/// prompter all arrive here.
pub struct UpgradeParams<'a> {
    /// Crawl root; installations anywhere beneath it are candidates.
    pub cwd: PathBuf,

    pub fs: &'a dyn Fs,
    pub downloader: &'a dyn Downloader,
    pub renderer: &'a dyn Renderer,
    pub clock: &'a dyn Clock,
    pub prompter: Option<&'a dyn Prompter>,
    pub cancel: CancelFlag,

    /// Uniform replacement for every manifest's recorded location. Also
    /// disables dependency edges: overridden manifests are independent.
    pub template_location_override: Option<String>,
    pub git_protocol: String,
    /// Boolean expression over the manifest's raw YAML; empty selects all.
    pub manifest_filter_expr: Option<String>,
    /// Manifest (relative or absolute path) to restart a halted run from.
    pub resume_from: Option<PathBuf>,
    /// Reversal conflicts the user fixed by hand; applies only to the
    /// first manifest processed.
    pub already_resolved: Vec<String>,
    pub inputs: BTreeMap<String, String>,
    pub input_files: Vec<PathBuf>,
    pub skip_input_validation: bool,
    pub keep_temp_dirs: bool,
    pub version_override: Option<String>,
}

/// Upgrade every selected installation under `cwd`, in dependency order.
///
/// Crawl, load, filter, order, then drive the per-installation pipeline.
/// The driver stops at the first error or at the first result that
/// requires user attention; whatever completed stays in `results`.
pub fn upgrade_all(p: &UpgradeParams<'_>) -> UpgradeResult {
    let mut results = Vec::new();
    let mut err_manifest_path = None;
    let err = drive(p, &mut results, &mut err_manifest_path).err();

    let overall = results
        .iter()
        .map(|r| r.result_type)
        .max()
        .unwrap_or(ResultType::None);

    UpgradeResult {
        overall,
        results,
        err,
        err_manifest_path,
    }
}

fn drive(
    p: &UpgradeParams<'_>,
    results: &mut Vec<ManifestResult>,
    err_manifest_path: &mut Option<PathBuf>,
) -> Result<(), AbcError> {
    let root = &p.cwd;
    let rels = crawl::crawl_manifests(root)?;
    if rels.is_empty() {
        return Err(AbcError::NoManifestsFound(root.clone()));
    }

    // Load everything up front; the raw bytes feed the filter.
    let filter = p.manifest_filter_expr.as_deref().unwrap_or("");
    let mut selected: Vec<(PathBuf, PathBuf, Manifest)> = Vec::new();
    for rel in rels {
        let abs = root.join(&rel);
        let (m, raw) = manifest::load_manifest(&abs)?;
        if crawl::matches_filter(filter, &raw)? {
            selected.push((rel, abs, m));
        }
    }
    if selected.is_empty() {
        return Err(AbcError::NoManifestsFound(root.clone()));
    }

    let entries: Vec<GraphEntry<'_>> = selected
        .iter()
        .map(|(rel, abs, m)| GraphEntry {
            node: rel.clone(),
            install_root: manifest::install_root(abs)
                .unwrap_or(abs.as_path())
                .to_path_buf(),
            manifest: m,
        })
        .collect();
    let dep_graph = graph::dep_graph(&entries, p.template_location_override.is_some());
    let order = dep_graph.topological_sort()?;

    let by_node: BTreeMap<&Path, (&PathBuf, &Manifest)> = selected
        .iter()
        .map(|(rel, abs, m)| (rel.as_path(), (abs, m)))
        .collect();

    let start = match &p.resume_from {
        Some(resume) => order
            .iter()
            .position(|n| n == resume || &root.join(n) == resume)
            .ok_or_else(|| AbcError::ResumeNotFound(resume.clone()))?,
        None => 0,
    };

    for (i, node) in order.iter().enumerate().skip(start) {
        if p.cancel.load(Ordering::Relaxed) {
            return Err(AbcError::Cancelled);
        }
        let (abs, m) = by_node[node.as_path()];

        // The already-resolved list belongs to the manifest that had the
        // prior conflict, which is the one a resumed run starts at.
        let already_resolved: &[String] = if i == start {
            &p.already_resolved
        } else {
            &[]
        };

        let mut result = pipeline::upgrade_manifest(p, node, abs, m, already_resolved)
            .map_err(|e| {
                *err_manifest_path = Some(node.clone());
                e
            })?;
        result.depended_on = dep_graph.edges_from(node);

        let halt = result.result_type.requires_user_attention();
        results.push(result);
        if halt {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_type_severity_order() {
        assert!(ResultType::None < ResultType::AlreadyUpToDate);
        assert!(ResultType::AlreadyUpToDate < ResultType::Success);
        assert!(ResultType::Success < ResultType::PatchReversalConflict);
        assert!(ResultType::PatchReversalConflict < ResultType::MergeConflict);
    }

    #[test]
    fn test_requires_user_attention() {
        assert!(ResultType::PatchReversalConflict.requires_user_attention());
        assert!(ResultType::MergeConflict.requires_user_attention());
        assert!(!ResultType::Success.requires_user_attention());
        assert!(!ResultType::AlreadyUpToDate.requires_user_attention());
        assert!(!ResultType::None.requires_user_attention());
    }
}
