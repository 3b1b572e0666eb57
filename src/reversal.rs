use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::error::AbcError;
use crate::fsys::Fs;
use crate::manifest::Manifest;

/// Suffix of the reject file the `patch` utility leaves next to a file
/// whose reversal hunks did not apply. The residual-conflict scan treats
/// any path ending in this as an unresolved upgrade.
pub const REJECTED_HUNKS_SUFFIX: &str = ".patch.rej";

/// One include-from-destination file whose recorded reversal patch could
/// not be applied cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct ReversalConflict {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub rejected_hunks_path: PathBuf,
}

pub struct ReversalParams<'a> {
    pub fs: &'a dyn Fs,
    pub old_manifest: &'a Manifest,
    pub installed_dir: &'a Path,
    /// Receives the reverse-patched copies, mirroring the relative layout.
    pub reversed_dir: &'a Path,
    /// Files the user has already restored by hand; copied verbatim.
    pub already_resolved: &'a [String],
}

/// Undo the template's previous in-place edits.
///
/// For every output in the old manifest with a non-empty reversal patch,
/// produce the pre-edit content under `reversed_dir`. Hunk failures are
/// collected (exit 1 from `patch`, reject file written) and reported
/// together; any other `patch` exit is fatal. The fuzz factor is
/// deliberately huge so unrelated context drift still reverses.
pub fn reverse_patches(p: &ReversalParams<'_>) -> Result<Vec<ReversalConflict>, AbcError> {
    let mut conflicts = Vec::new();

    for out in &p.old_manifest.output_files {
        let patch = match &out.patch {
            Some(text) if !text.trim().is_empty() => text,
            _ => continue,
        };

        let installed = p.installed_dir.join(&out.path);
        let target = p.reversed_dir.join(&out.path);
        if let Some(parent) = target.parent() {
            p.fs
                .create_dir_all(parent)
                .map_err(|e| AbcError::Filesystem {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        if p.already_resolved.iter().any(|r| r == &out.path) {
            // The user re-applied the reversal by hand; take the installed
            // file as-is.
            p.fs
                .copy(&installed, &target)
                .map_err(|e| AbcError::Filesystem {
                    path: installed.clone(),
                    source: e,
                })?;
            continue;
        }

        let reject = reject_path(&installed);
        match apply_reverse_patch(patch, &installed, &target, &reject)? {
            PatchOutcome::Applied => {}
            PatchOutcome::Rejected => conflicts.push(ReversalConflict {
                rel_path: out.path.clone(),
                abs_path: installed,
                rejected_hunks_path: reject,
            }),
        }
    }
    Ok(conflicts)
}

/// `<installed file>.patch.rej`, next to the file it belongs to.
fn reject_path(installed: &Path) -> PathBuf {
    let mut s = installed.as_os_str().to_os_string();
    s.push(REJECTED_HUNKS_SUFFIX);
    PathBuf::from(s)
}

enum PatchOutcome {
    Applied,
    Rejected,
}

/// Run the system `patch` utility with the diff on stdin.
///
/// Exit 0 = applied; exit 1 = hunk conflicts with the reject file
/// populated; anything else is an unexpected tool failure.
fn apply_reverse_patch(
    patch: &str,
    installed: &Path,
    output: &Path,
    reject: &Path,
) -> Result<PatchOutcome, AbcError> {
    let mut child = Command::new("patch")
        .arg("--unified")
        .arg("--strip")
        .arg("1")
        .arg("--output")
        .arg(output)
        .arg("--fuzz")
        .arg("999")
        .arg("--reject-file")
        .arg(reject)
        .arg(installed)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| AbcError::PatchToolFailure {
            path: installed.to_path_buf(),
            status: "failed to spawn".into(),
            stderr: e.to_string(),
        })?;

    child
        .stdin
        .take()
        .ok_or_else(|| AbcError::PatchToolFailure {
            path: installed.to_path_buf(),
            status: "no stdin".into(),
            stderr: String::new(),
        })?
        .write_all(patch.as_bytes())
        .map_err(|e| AbcError::Filesystem {
            path: installed.to_path_buf(),
            source: e,
        })?;

    let out = child.wait_with_output().map_err(|e| AbcError::Filesystem {
        path: installed.to_path_buf(),
        source: e,
    })?;

    match out.status.code() {
        Some(0) => Ok(PatchOutcome::Applied),
        Some(1) => Ok(PatchOutcome::Rejected),
        other => Err(AbcError::PatchToolFailure {
            path: installed.to_path_buf(),
            status: other
                .map(|c| c.to_string())
                .unwrap_or_else(|| "killed by signal".into()),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsys::RealFs;
    use crate::manifest::{
        InputValue, LocationType, Manifest, OutputFile, API_VERSION_LATEST, KIND_MANIFEST,
    };
    use chrono::{TimeZone, Utc};
    use similar::TextDiff;
    use std::fs;

    fn manifest_with_patch(rel: &str, patch: &str) -> Manifest {
        Manifest {
            api_version: API_VERSION_LATEST.into(),
            kind: KIND_MANIFEST.into(),
            creation_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            modification_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            template_location: "../t".into(),
            location_type: LocationType::LocalGit,
            template_version: "v1".into(),
            upgrade_channel: None,
            template_dirhash: "h1:eA==".into(),
            inputs: Vec::<InputValue>::new(),
            output_files: vec![OutputFile {
                path: rel.into(),
                hash: "h1:eA==".into(),
                patch: Some(patch.into()),
            }],
        }
    }

    fn reversal_diff(rel: &str, edited: &str, original: &str) -> String {
        let diff = TextDiff::from_lines(edited, original);
        diff.unified_diff()
            .context_radius(3)
            .header(&format!("a/{rel}"), &format!("b/{rel}"))
            .to_string()
    }

    #[test]
    fn test_reverse_patch_applies() {
        let tmp = tempfile::tempdir().unwrap();
        let installed = tmp.path().join("install");
        let reversed = tmp.path().join("reversed");
        fs::create_dir_all(&installed).unwrap();
        fs::create_dir_all(&reversed).unwrap();

        let edited = "red is my favorite color\n";
        let original = "purple is my favorite color\n";
        fs::write(installed.join("fav.txt"), edited).unwrap();
        let m = manifest_with_patch("fav.txt", &reversal_diff("fav.txt", edited, original));

        let conflicts = reverse_patches(&ReversalParams {
            fs: &RealFs,
            old_manifest: &m,
            installed_dir: &installed,
            reversed_dir: &reversed,
            already_resolved: &[],
        })
        .unwrap();

        assert!(conflicts.is_empty());
        assert_eq!(
            fs::read_to_string(reversed.join("fav.txt")).unwrap(),
            original
        );
    }

    #[test]
    fn test_reverse_patch_tolerates_context_drift() {
        let tmp = tempfile::tempdir().unwrap();
        let installed = tmp.path().join("install");
        let reversed = tmp.path().join("reversed");
        fs::create_dir_all(&installed).unwrap();
        fs::create_dir_all(&reversed).unwrap();

        let edited = "red is my favorite color\n";
        let original = "purple is my favorite color\n";
        // The user prepended unrelated lines after the render.
        fs::write(
            installed.join("fav.txt"),
            format!("a note to self\n{edited}"),
        )
        .unwrap();
        let m = manifest_with_patch("fav.txt", &reversal_diff("fav.txt", edited, original));

        let conflicts = reverse_patches(&ReversalParams {
            fs: &RealFs,
            old_manifest: &m,
            installed_dir: &installed,
            reversed_dir: &reversed,
            already_resolved: &[],
        })
        .unwrap();

        assert!(conflicts.is_empty());
        let got = fs::read_to_string(reversed.join("fav.txt")).unwrap();
        assert!(got.contains(original));
        assert!(got.contains("a note to self"));
    }

    #[test]
    fn test_reverse_patch_conflict_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let installed = tmp.path().join("install");
        let reversed = tmp.path().join("reversed");
        fs::create_dir_all(&installed).unwrap();
        fs::create_dir_all(&reversed).unwrap();

        let edited = "red is my favorite color\n";
        let original = "purple is my favorite color\n";
        // The user rewrote the very line the reversal targets.
        fs::write(installed.join("fav.txt"), "green is my favorite color\n").unwrap();
        let m = manifest_with_patch("fav.txt", &reversal_diff("fav.txt", edited, original));

        let conflicts = reverse_patches(&ReversalParams {
            fs: &RealFs,
            old_manifest: &m,
            installed_dir: &installed,
            reversed_dir: &reversed,
            already_resolved: &[],
        })
        .unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].rel_path, "fav.txt");
        assert!(conflicts[0].rejected_hunks_path.exists());
        assert!(conflicts[0]
            .rejected_hunks_path
            .to_string_lossy()
            .ends_with(REJECTED_HUNKS_SUFFIX));
    }

    #[test]
    fn test_already_resolved_copies_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let installed = tmp.path().join("install");
        let reversed = tmp.path().join("reversed");
        fs::create_dir_all(&installed).unwrap();
        fs::create_dir_all(&reversed).unwrap();

        // The user restored the pre-template content by hand.
        fs::write(installed.join("fav.txt"), "purple is my favorite color\n").unwrap();
        let m = manifest_with_patch(
            "fav.txt",
            &reversal_diff(
                "fav.txt",
                "red is my favorite color\n",
                "purple is my favorite color\n",
            ),
        );

        let conflicts = reverse_patches(&ReversalParams {
            fs: &RealFs,
            old_manifest: &m,
            installed_dir: &installed,
            reversed_dir: &reversed,
            already_resolved: &["fav.txt".to_string()],
        })
        .unwrap();

        assert!(conflicts.is_empty());
        assert_eq!(
            fs::read_to_string(reversed.join("fav.txt")).unwrap(),
            "purple is my favorite color\n"
        );
    }

    #[test]
    fn test_outputs_without_patch_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let installed = tmp.path().join("install");
        let reversed = tmp.path().join("reversed");
        fs::create_dir_all(&installed).unwrap();
        fs::create_dir_all(&reversed).unwrap();

        let mut m = manifest_with_patch("fav.txt", "ignored");
        m.output_files[0].patch = None;

        let conflicts = reverse_patches(&ReversalParams {
            fs: &RealFs,
            old_manifest: &m,
            installed_dir: &installed,
            reversed_dir: &reversed,
            already_resolved: &[],
        })
        .unwrap();
        assert!(conflicts.is_empty());
        assert!(!reversed.join("fav.txt").exists());
    }
}
