use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::download::DownloadRequest;
use crate::driver::{ManifestResult, ResultType, UpgradeParams};
use crate::error::AbcError;
use crate::hash;
use crate::inputs::{self, ResolveParams};
use crate::manifest::{
    self, Manifest, API_VERSION_LATEST, INTERNAL_DIR, KIND_MANIFEST,
};
use crate::merge::{self, MergeParams, CONFLICT_SUFFIX_PREFIX};
use crate::pathutil;
use crate::render::RenderParams;
use crate::reversal::{self, ReversalParams, REJECTED_HUNKS_SUFFIX};
use crate::template;
use crate::tempdirs::TempDirTracker;

/// Upgrade a single installation.
///
/// `node` is the manifest path relative to the crawl root (used in reports),
/// `manifest_abs` its absolute location. The driver fills `depended_on`
/// afterwards; everything else about the result is decided here.
pub(crate) fn upgrade_manifest(
    p: &UpgradeParams<'_>,
    node: &Path,
    manifest_abs: &Path,
    old_manifest: &Manifest,
    already_resolved: &[String],
) -> Result<ManifestResult, AbcError> {
    let installed_dir = manifest::install_root(manifest_abs)
        .ok_or_else(|| AbcError::MalformedManifest {
            path: manifest_abs.to_path_buf(),
            reason: "manifest is not inside an installation directory".into(),
        })?
        .to_path_buf();

    // A leftover conflict marker means the previous upgrade was never
    // resolved; refuse before touching anything.
    scan_residual_conflicts(&installed_dir)?;

    let location = p
        .template_location_override
        .clone()
        .unwrap_or_else(|| old_manifest.template_location.clone());
    if location.trim().is_empty() {
        return Err(AbcError::NonCanonicalInstallation(installed_dir));
    }

    // Temp dirs live exactly as long as this upgrade attempt.
    let mut tmp = TempDirTracker::new(p.keep_temp_dirs);
    let template_dir = tmp.create("template")?;
    let merge_dir = tmp.create("merge")?;
    let reversed_dir = tmp.create("reversed")?;

    let version = p
        .version_override
        .clone()
        .or_else(|| old_manifest.upgrade_channel.clone())
        .unwrap_or_else(|| "latest".to_string());
    let dl_meta = p
        .downloader
        .download(
            &DownloadRequest {
                installed_dir: &installed_dir,
                canonical_location: &location,
                location_type: old_manifest.location_type,
                git_protocol: &p.git_protocol,
                version: &version,
            },
            &template_dir,
        )
        .map_err(|e| AbcError::DownloadFailure {
            manifest: manifest_abs.to_path_buf(),
            reason: e,
        })?;

    // Same template bytes as last time: nothing to do, nothing touched.
    if hash::dir_hash(&template_dir)? == old_manifest.template_dirhash {
        return Ok(ManifestResult {
            manifest_path: node.to_path_buf(),
            result_type: ResultType::AlreadyUpToDate,
            dl_meta: Some(dl_meta),
            non_conflicts: Vec::new(),
            merge_conflicts: Vec::new(),
            reversal_conflicts: Vec::new(),
            depended_on: Vec::new(),
        });
    }

    // Undo the previous version's in-place edits so the re-render sees the
    // user's current content in its pre-template form.
    let reversal_conflicts = reversal::reverse_patches(&ReversalParams {
        fs: p.fs,
        old_manifest,
        installed_dir: &installed_dir,
        reversed_dir: &reversed_dir,
        already_resolved,
    })?;
    if !reversal_conflicts.is_empty() {
        return Ok(ManifestResult {
            manifest_path: node.to_path_buf(),
            result_type: ResultType::PatchReversalConflict,
            dl_meta: Some(dl_meta),
            non_conflicts: Vec::new(),
            merge_conflicts: Vec::new(),
            reversal_conflicts,
            depended_on: Vec::new(),
        });
    }

    let render_inputs =
        resolve_upgrade_inputs(p, &template_dir, old_manifest).map_err(|e| match e {
            AbcError::Other(reason) => AbcError::RenderFailure {
                manifest: manifest_abs.to_path_buf(),
                reason,
            },
            other => other,
        })?;

    let new_manifest_path = p
        .renderer
        .render(&RenderParams {
            template_dir: &template_dir,
            dest_dir: &installed_dir,
            out_dir: &merge_dir,
            include_from_dest_extra: Some(&reversed_dir),
            inputs: &render_inputs,
            dl_meta: &dl_meta,
            clock: p.clock,
        })
        .map_err(|e| AbcError::RenderFailure {
            manifest: manifest_abs.to_path_buf(),
            reason: e,
        })?;
    let (new_manifest, _) = manifest::load_manifest(&new_manifest_path)?;

    // Dry run first: surface filesystem trouble before any real mutation.
    let merge_params = MergeParams {
        fs: p.fs,
        old_manifest,
        new_manifest: &new_manifest,
        installed_dir: &installed_dir,
        merge_dir: &merge_dir,
        reversed_dir: &reversed_dir,
        cancel: &p.cancel,
        dry_run: true,
    };
    merge::execute_merge(&merge_params)?;
    let actions_taken = merge::execute_merge(&MergeParams {
        dry_run: false,
        ..merge_params
    })?;

    let (merge_conflicts, non_conflicts): (Vec<_>, Vec<_>) = actions_taken
        .into_iter()
        .partition(|a| a.action.is_conflict());
    let result_type = if merge_conflicts.is_empty() {
        ResultType::Success
    } else {
        ResultType::MergeConflict
    };

    // Commit the new manifest either way: hashes and dirhash must describe
    // the new render so the next upgrade can tell local edits apart.
    let final_manifest = Manifest {
        api_version: API_VERSION_LATEST.into(),
        kind: KIND_MANIFEST.into(),
        creation_time: old_manifest.creation_time,
        modification_time: p.clock.now_utc(),
        ..new_manifest
    };
    manifest::save_manifest(p.fs, manifest_abs, &final_manifest)?;

    Ok(ManifestResult {
        manifest_path: node.to_path_buf(),
        result_type,
        dl_meta: Some(dl_meta),
        non_conflicts,
        merge_conflicts,
        reversal_conflicts: Vec::new(),
        depended_on: Vec::new(),
    })
}

/// Fail if any path under the installation (outside `.abc`) still carries
/// a conflict marker from a previous upgrade.
fn scan_residual_conflicts(installed_dir: &Path) -> Result<(), AbcError> {
    let mut markers = Vec::new();
    let walker = WalkDir::new(installed_dir)
        .into_iter()
        .filter_entry(|e| e.file_name() != INTERNAL_DIR);
    for entry in walker {
        let entry = entry.map_err(|e| AbcError::Filesystem {
            path: installed_dir.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })?;
        let name = entry.file_name().to_string_lossy();
        if name.contains(CONFLICT_SUFFIX_PREFIX) || name.ends_with(REJECTED_HUNKS_SUFFIX) {
            if let Some(rel) = pathutil::rel_str(installed_dir, entry.path()) {
                markers.push(PathBuf::from(rel));
            }
        }
    }
    if markers.is_empty() {
        return Ok(());
    }
    markers.sort();
    Err(AbcError::ResidualConflicts {
        root: installed_dir.to_path_buf(),
        paths: markers,
    })
}

/// Inputs for the re-render: the old manifest's recorded values (filtered
/// to what the new template version still declares), overridden by any
/// `--input` flags, topped up from files, defaults, or the prompter for
/// inputs the new version introduces. Recorded inputs the template no
/// longer declares are dropped.
fn resolve_upgrade_inputs(
    p: &UpgradeParams<'_>,
    template_dir: &Path,
    old_manifest: &Manifest,
) -> Result<Vec<crate::manifest::InputValue>, AbcError> {
    let def = template::load_template(template_dir)?;

    let declared: std::collections::BTreeSet<&str> =
        def.inputs.iter().map(|d| d.name.as_str()).collect();
    let mut merged: BTreeMap<String, String> = old_manifest
        .inputs
        .iter()
        .filter(|i| declared.contains(i.name.as_str()))
        .map(|i| (i.name.clone(), i.value.clone()))
        .collect();
    for (k, v) in &p.inputs {
        merged.insert(k.clone(), v.clone());
    }

    inputs::resolve_inputs(
        &def.inputs,
        &ResolveParams {
            flag_inputs: &merged,
            input_files: &p.input_files,
            prompter: p.prompter,
            skip_validation: p.skip_input_validation,
        },
    )
}
