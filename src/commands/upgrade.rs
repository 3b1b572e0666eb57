use std::env;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::download::LocalDownloader;
use crate::driver::{self, ManifestResult, ResultType, UpgradeParams, UpgradeResult};
use crate::error::AbcError;
use crate::fsys::{CancelFlag, RealFs, SystemClock};
use crate::inputs::{Prompter, TtyPrompter};
use crate::render::TemplateRenderer;

pub struct UpgradeOpts {
    pub cwd: Option<PathBuf>,
    pub template_location: Option<String>,
    pub git_protocol: String,
    pub filter: Option<String>,
    pub resume_from: Option<PathBuf>,
    pub already_resolved: Vec<String>,
    pub inputs: Vec<String>,
    pub input_files: Vec<PathBuf>,
    pub prompt: bool,
    pub skip_input_validation: bool,
    pub keep_temp_dirs: bool,
    pub version: Option<String>,
    pub json: bool,
}

/// Exit code when one or more manifests ended in a conflict. Distinct from
/// the generic failure exit so scripts can tell "needs a human" from
/// "broke".
pub const CONFLICT_EXIT_CODE: i32 = 2;

/// Upgrade every installation under the working directory.
///
/// Returns the process exit code: 0 for success or already-up-to-date,
/// `CONFLICT_EXIT_CODE` when user attention is required.
pub fn run(opts: &UpgradeOpts) -> Result<i32, AbcError> {
    let cwd = match &opts.cwd {
        Some(d) => d.clone(),
        None => env::current_dir()?,
    };

    // Ctrl-C flips the flag; the driver finishes the in-flight file and
    // stops cleanly.
    let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&cancel))?;

    let prompter = TtyPrompter;
    let params = UpgradeParams {
        cwd,
        fs: &RealFs,
        downloader: &LocalDownloader,
        renderer: &TemplateRenderer,
        clock: &SystemClock,
        prompter: opts.prompt.then_some(&prompter as &dyn Prompter),
        cancel,
        template_location_override: opts.template_location.clone(),
        git_protocol: opts.git_protocol.clone(),
        manifest_filter_expr: opts.filter.clone(),
        resume_from: opts.resume_from.clone(),
        already_resolved: opts.already_resolved.clone(),
        inputs: super::parse_kv(&opts.inputs)?,
        input_files: opts.input_files.clone(),
        skip_input_validation: opts.skip_input_validation,
        keep_temp_dirs: opts.keep_temp_dirs,
        version_override: opts.version.clone(),
    };

    let spinner = (!opts.json).then(|| {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .expect("static template is valid"),
        );
        pb.set_message("upgrading installations...");
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    });

    let result = driver::upgrade_all(&params);

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    if opts.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result)
                .map_err(|e| anyhow::anyhow!("serializing report: {e}"))?
        );
    } else {
        print_report(&result);
    }

    if let Some(err) = result.err {
        if let Some(mp) = &result.err_manifest_path {
            eprintln!("failed while upgrading {}", mp.display());
        }
        return Err(err);
    }

    if result.overall.requires_user_attention() {
        Ok(CONFLICT_EXIT_CODE)
    } else {
        Ok(0)
    }
}

fn print_report(result: &UpgradeResult) {
    for r in &result.results {
        print_manifest_result(r);
    }
    println!("overall: {}", result.overall);
}

fn print_manifest_result(r: &ManifestResult) {
    println!("{}: {}", r.manifest_path.display(), r.result_type);

    match r.result_type {
        ResultType::AlreadyUpToDate => {}
        ResultType::PatchReversalConflict => {
            for c in &r.reversal_conflicts {
                println!(
                    "  could not reverse the previous template edit of {}",
                    c.rel_path
                );
                println!("    rejected hunks: {}", c.rejected_hunks_path.display());
            }
            println!(
                "  restore the affected file(s), then rerun with \
                 --resume-from {} --already-resolved <file>",
                r.manifest_path.display()
            );
        }
        _ => {
            for a in &r.non_conflicts {
                println!("  {}: {}", a.action, a.path);
            }
            for a in &r.merge_conflicts {
                println!("  {}: {} ({})", a.action, a.path, a.explanation);
                if let Some(ours) = &a.ours_path {
                    println!("    your version: {ours}");
                }
                if let Some(incoming) = &a.incoming_path {
                    println!("    incoming version: {incoming}");
                }
            }
        }
    }
}
