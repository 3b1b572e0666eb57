use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context as _};
use similar::TextDiff;
use walkdir::WalkDir;

use crate::download::DownloadMetadata;
use crate::fsys::{Clock, RealFs};
use crate::hash;
use crate::manifest::{
    self, Manifest, OutputFile, API_VERSION_LATEST, INTERNAL_DIR, KIND_MANIFEST,
};
use crate::manifest::InputValue;
use crate::pathutil;
use crate::template::{self, Step, TEMPLATE_FILE};

/// Everything a renderer needs for one render pass.
pub struct RenderParams<'a> {
    /// Populated template source tree.
    pub template_dir: &'a Path,
    /// The installation root; include-from-destination edits read from
    /// here unless the file is present under `include_from_dest_extra`.
    pub dest_dir: &'a Path,
    /// Staging directory the renderer writes into. Never the installation.
    pub out_dir: &'a Path,
    /// Reverse-patched copies of previously edited files; takes precedence
    /// over `dest_dir` so re-renders see pre-edit content.
    pub include_from_dest_extra: Option<&'a Path>,
    pub inputs: &'a [InputValue],
    pub dl_meta: &'a DownloadMetadata,
    pub clock: &'a dyn Clock,
}

/// Renders a template into a staging directory and writes the resulting
/// manifest. Returns the path of that manifest.
///
/// Errors are plain `anyhow`; the pipeline wraps them with the manifest
/// being processed.
pub trait Renderer {
    fn render(&self, p: &RenderParams<'_>) -> Result<PathBuf, anyhow::Error>;
}

/// The built-in renderer driven by `template.yaml`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateRenderer;

impl Renderer for TemplateRenderer {
    fn render(&self, p: &RenderParams<'_>) -> Result<PathBuf, anyhow::Error> {
        let def = template::load_template(p.template_dir)?;

        let mut ctx: BTreeMap<String, String> = BTreeMap::new();
        for (k, v) in &p.dl_meta.vars {
            ctx.insert(k.clone(), v.clone());
        }
        for input in p.inputs {
            ctx.insert(input.name.clone(), input.value.clone());
        }
        let env = minijinja::Environment::new();

        // rel path -> reversal patch, for edit steps that changed content.
        let mut patches: BTreeMap<String, String> = BTreeMap::new();

        for step in &def.steps {
            match step {
                Step::Include(inc) => {
                    for rel in &inc.paths {
                        render_include(p, &env, &ctx, rel)?;
                    }
                }
                Step::Edit(edit) => {
                    let patch = render_edit(p, &env, &ctx, &edit.path, &edit.replace)?;
                    if let Some(patch) = patch {
                        patches.insert(edit.path.clone(), patch);
                    }
                }
            }
        }

        let manifest = build_manifest(p, patches)?;
        let internal = p.out_dir.join(INTERNAL_DIR);
        fs::create_dir_all(&internal)
            .with_context(|| format!("creating {}", internal.display()))?;
        let manifest_path = internal.join("manifest.yaml");
        manifest::save_manifest(&RealFs, &manifest_path, &manifest)?;
        Ok(manifest_path)
    }
}

/// Copy one include path (file or subtree) into the staging directory,
/// rendering UTF-8 file bodies against the inputs. `template.yaml` itself
/// is never an output.
fn render_include(
    p: &RenderParams<'_>,
    env: &minijinja::Environment<'_>,
    ctx: &BTreeMap<String, String>,
    rel: &str,
) -> Result<(), anyhow::Error> {
    let src_root = pathutil::lexical_normalize(&p.template_dir.join(rel));
    if !src_root.exists() {
        bail!("include path {rel:?} does not exist in the template");
    }

    let files: Vec<PathBuf> = if src_root.is_dir() {
        WalkDir::new(&src_root)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("walking include path {rel:?}"))?
            .into_iter()
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    } else {
        vec![src_root.clone()]
    };

    for src in files {
        let out_rel = pathutil::rel_str(p.template_dir, &src)
            .ok_or_else(|| anyhow!("include path {} escapes the template", src.display()))?;
        if out_rel == TEMPLATE_FILE {
            continue;
        }
        let target = p.out_dir.join(&out_rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let raw = fs::read(&src).with_context(|| format!("reading {}", src.display()))?;
        match String::from_utf8(raw) {
            Ok(text) => {
                let rendered = env
                    .render_str(&text, ctx)
                    .with_context(|| format!("rendering {out_rel}"))?;
                fs::write(&target, rendered)
                    .with_context(|| format!("writing {}", target.display()))?;
            }
            // Binary content is copied verbatim.
            Err(e) => {
                fs::write(&target, e.into_bytes())
                    .with_context(|| format!("writing {}", target.display()))?;
            }
        }
    }
    Ok(())
}

/// Apply an include-from-destination edit and return the reversal patch,
/// or `None` when the replacements changed nothing.
fn render_edit(
    p: &RenderParams<'_>,
    env: &minijinja::Environment<'_>,
    ctx: &BTreeMap<String, String>,
    rel: &str,
    replacements: &[template::Replacement],
) -> Result<Option<String>, anyhow::Error> {
    let src = match p.include_from_dest_extra {
        Some(extra) if extra.join(rel).is_file() => extra.join(rel),
        _ => p.dest_dir.join(rel),
    };
    let original = fs::read_to_string(&src).with_context(|| {
        format!("include-from-destination file {rel:?} not readable at {}", src.display())
    })?;

    let mut edited = original.clone();
    for r in replacements {
        let to = env
            .render_str(&r.to, ctx)
            .with_context(|| format!("rendering replacement for {rel}"))?;
        edited = edited.replace(&r.from, &to);
    }

    let target = p.out_dir.join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(&target, &edited).with_context(|| format!("writing {}", target.display()))?;

    if edited == original {
        return Ok(None);
    }

    // The reversal direction: applying this patch to the edited file
    // restores the pre-edit content.
    let diff = TextDiff::from_lines(&edited, &original);
    let patch = diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{rel}"), &format!("b/{rel}"))
        .to_string();
    Ok(Some(patch))
}

/// Hash everything under the staging directory and assemble the manifest.
fn build_manifest(
    p: &RenderParams<'_>,
    patches: BTreeMap<String, String>,
) -> Result<Manifest, anyhow::Error> {
    let mut output_files = Vec::new();
    for entry in WalkDir::new(p.out_dir) {
        let entry = entry.with_context(|| format!("walking {}", p.out_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = pathutil::rel_str(p.out_dir, entry.path())
            .ok_or_else(|| anyhow!("output escapes staging dir: {}", entry.path().display()))?;
        if rel == INTERNAL_DIR || rel.starts_with(&format!("{INTERNAL_DIR}/")) {
            continue;
        }
        let h = hash::file_hash(entry.path())?;
        output_files.push(OutputFile {
            path: rel.clone(),
            hash: h,
            patch: patches.get(&rel).cloned(),
        });
    }
    output_files.sort_by(|a, b| a.path.cmp(&b.path));

    let now = p.clock.now_utc();
    Ok(Manifest {
        api_version: API_VERSION_LATEST.into(),
        kind: KIND_MANIFEST.into(),
        creation_time: now,
        modification_time: now,
        template_location: p.dl_meta.canonical_location.clone(),
        location_type: p.dl_meta.location_type,
        template_version: p.dl_meta.version.clone(),
        upgrade_channel: p.dl_meta.upgrade_channel.clone(),
        template_dirhash: hash::dir_hash(p.template_dir)?,
        inputs: p.inputs.to_vec(),
        output_files,
    })
}
