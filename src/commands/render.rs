use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _};
use walkdir::WalkDir;

use crate::download::{DownloadRequest, Downloader, LocalDownloader};
use crate::error::AbcError;
use crate::fsys::SystemClock;
use crate::hash;
use crate::inputs::{self, ResolveParams, TtyPrompter};
use crate::manifest::{LocationType, INTERNAL_DIR};
use crate::pathutil;
use crate::render::{RenderParams, Renderer, TemplateRenderer};
use crate::template;
use crate::tempdirs::TempDirTracker;

pub struct RenderOpts {
    pub source: String,
    pub dest: Option<PathBuf>,
    pub inputs: Vec<String>,
    pub input_files: Vec<PathBuf>,
    pub prompt: bool,
    pub skip_input_validation: bool,
    pub keep_temp_dirs: bool,
}

/// First-time render: resolve the template, resolve its inputs, render
/// into staging, then commit the staged tree and manifest into `dest`.
pub fn run(opts: &RenderOpts) -> Result<(), AbcError> {
    let dest = match &opts.dest {
        Some(d) => d.clone(),
        None => env::current_dir()?,
    };
    fs::create_dir_all(&dest)?;

    let mut tmp = TempDirTracker::new(opts.keep_temp_dirs);
    let template_dir = tmp.create("template")?;
    let staging_dir = tmp.create("render")?;

    let dl_meta = LocalDownloader
        .download(
            &DownloadRequest {
                installed_dir: &dest,
                canonical_location: &opts.source,
                location_type: LocationType::Other,
                git_protocol: "https",
                version: "latest",
            },
            &template_dir,
        )
        .map_err(|e| AbcError::DownloadFailure {
            manifest: dest.join(INTERNAL_DIR),
            reason: e,
        })?;

    let def = template::load_template(&template_dir)?;
    let flag_inputs = super::parse_kv(&opts.inputs)?;
    let prompter = TtyPrompter;
    let resolved = inputs::resolve_inputs(
        &def.inputs,
        &ResolveParams {
            flag_inputs: &flag_inputs,
            input_files: &opts.input_files,
            prompter: opts.prompt.then_some(&prompter as &dyn inputs::Prompter),
            skip_validation: opts.skip_input_validation,
        },
    )?;

    let clock = SystemClock;
    TemplateRenderer
        .render(&RenderParams {
            template_dir: &template_dir,
            dest_dir: &dest,
            out_dir: &staging_dir,
            include_from_dest_extra: None,
            inputs: &resolved,
            dl_meta: &dl_meta,
            clock: &clock,
        })
        .map_err(|e| AbcError::RenderFailure {
            manifest: dest.join(INTERNAL_DIR),
            reason: e,
        })?;

    let written = commit_staging(&staging_dir, &dest)?;
    println!(
        "rendered {} file(s) from {} into {}",
        written,
        opts.source,
        dest.display()
    );
    Ok(())
}

/// Move the staged render into the destination.
///
/// Refuses to clobber an existing file whose content differs, except for
/// include-from-destination outputs, which by definition rewrite files
/// that were already there.
fn commit_staging(staging_dir: &Path, dest: &Path) -> Result<usize, AbcError> {
    let manifest_rel = format!("{INTERNAL_DIR}/manifest.yaml");
    let (manifest_staged, _) =
        crate::manifest::load_manifest(&staging_dir.join(&manifest_rel))?;
    let edited: std::collections::BTreeSet<&str> = manifest_staged
        .output_files
        .iter()
        .filter(|f| f.patch.is_some())
        .map(|f| f.path.as_str())
        .collect();

    // Check before writing anything.
    for entry in WalkDir::new(staging_dir) {
        let entry = entry.map_err(|e| AbcError::Filesystem {
            path: staging_dir.to_path_buf(),
            source: std::io::Error::other(e.to_string()),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = pathutil::rel_str(staging_dir, entry.path())
            .ok_or_else(|| anyhow!("staged path escapes staging dir"))?;
        if rel.starts_with(INTERNAL_DIR) || edited.contains(rel.as_str()) {
            continue;
        }
        let target = dest.join(&rel);
        if target.exists() {
            let staged_hash = hash::file_hash(entry.path())?;
            let existing_hash = hash::file_hash(&target)?;
            if staged_hash != existing_hash {
                return Err(anyhow!(
                    "refusing to overwrite {}: a different file already exists",
                    target.display()
                )
                .into());
            }
        }
    }

    let mut written = 0;
    for entry in WalkDir::new(staging_dir) {
        let entry = entry.with_context(|| format!("walking {}", staging_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = pathutil::rel_str(staging_dir, entry.path())
            .ok_or_else(|| anyhow!("staged path escapes staging dir"))?;
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| AbcError::Filesystem {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        fs::copy(entry.path(), &target).map_err(|e| AbcError::Filesystem {
            path: target.clone(),
            source: e,
        })?;
        if !rel.starts_with(INTERNAL_DIR) {
            written += 1;
        }
    }
    Ok(written)
}
