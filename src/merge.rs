use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::decision::{self, Action, DecisionInput};
use crate::error::AbcError;
use crate::fsys::{CancelFlag, Fs};
use crate::hash::{self, HashResult};
use crate::manifest::{hashes_as_map, Manifest};

/// Shared prefix of every conflict-preserving filename the merge creates.
/// The residual-conflict scan refuses to upgrade while any path contains it.
pub const CONFLICT_SUFFIX_PREFIX: &str = ".abcmerge_";

/// Suffixes attached next to the canonical path when a conflict must keep
/// both sides.
pub const SUFFIX_LOCALLY_ADDED: &str = ".abcmerge_locally_added";
pub const SUFFIX_FROM_NEW_TEMPLATE: &str = ".abcmerge_from_new_template";
pub const SUFFIX_LOCALLY_DELETED: &str = ".abcmerge_locally_deleted_vs_new_template_version";
pub const SUFFIX_WANT_TO_DELETE: &str = ".abcmerge_template_wants_to_delete";

/// What the merge did (or, under dry-run, would do) for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionTaken {
    pub action: Action,
    pub explanation: String,
    pub path: String,
    /// The preserved copy of the user's side, for conflicts that move it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ours_path: Option<String>,
    /// Where the incoming template side was written, for conflicts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming_path: Option<String>,
}

pub struct MergeParams<'a> {
    pub fs: &'a dyn Fs,
    pub old_manifest: &'a Manifest,
    pub new_manifest: &'a Manifest,
    /// The user's tree; the only place a real run writes.
    pub installed_dir: &'a Path,
    /// Staging directory the renderer produced.
    pub merge_dir: &'a Path,
    /// Reverse-patched copies; presence of a file here marks it
    /// include-from-destination.
    pub reversed_dir: &'a Path,
    pub cancel: &'a CancelFlag,
    /// Collect decisions and check filesystem health without mutating.
    pub dry_run: bool,
}

/// Walk the union of old and new outputs, decide each file, and actuate.
///
/// Files are processed in sorted order and the result is sorted by path,
/// so identical inputs produce identical reports. The dry run performs the
/// same reads (hashing, existence checks) but no writes; running it first
/// surfaces filesystem trouble before anything is touched.
pub fn execute_merge(p: &MergeParams<'_>) -> Result<Vec<ActionTaken>, AbcError> {
    let old_hashes = hashes_as_map(&p.old_manifest.output_files);
    let new_hashes = hashes_as_map(&p.new_manifest.output_files);

    let files: BTreeSet<&String> = old_hashes.keys().chain(new_hashes.keys()).collect();

    let mut taken = Vec::with_capacity(files.len());
    for rel in files {
        if p.cancel.load(Ordering::Relaxed) {
            return Err(AbcError::Cancelled);
        }

        let is_in_old = old_hashes.contains_key(rel);
        let is_in_new = new_hashes.contains_key(rel);
        let from_old_local = p.installed_dir.join(rel);
        let from_new_template = p.merge_dir.join(rel);
        let is_included_from_destination = p.fs.exists(&p.reversed_dir.join(rel));

        let mut old_vs_old = HashResult::Absent;
        let mut new_vs_old = HashResult::Absent;
        let mut old_vs_new = HashResult::Absent;
        if is_in_old {
            old_vs_old = hash::hash_and_compare(p.fs, &from_old_local, &old_hashes[rel])?;
            new_vs_old = hash::hash_and_compare(p.fs, &from_new_template, &old_hashes[rel])?;
        }
        if is_in_new {
            old_vs_new = hash::hash_and_compare(p.fs, &from_old_local, &new_hashes[rel])?;
        }

        let decision = decision::decide(&DecisionInput {
            rel_path: rel,
            is_in_old,
            is_in_new,
            old_file_matches_old_hash: old_vs_old,
            new_file_matches_old_hash: new_vs_old,
            old_file_matches_new_hash: old_vs_new,
            is_included_from_destination,
        })?;

        taken.push(actuate(p, rel, decision.action, decision.explanation)?);
    }

    taken.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(taken)
}

/// Perform the filesystem effect of one decision. All writes are skipped
/// under dry-run; the returned record is identical either way.
fn actuate(
    p: &MergeParams<'_>,
    rel: &str,
    action: Action,
    explanation: &'static str,
) -> Result<ActionTaken, AbcError> {
    let fserr = |path: &Path, e: std::io::Error| AbcError::Filesystem {
        path: path.to_path_buf(),
        source: e,
    };

    let dest = p.installed_dir.join(rel);
    let incoming = p.merge_dir.join(rel);
    let mut ours_path = None;
    let mut incoming_path = None;

    match action {
        Action::Noop => {}

        Action::WriteNew => {
            if !p.dry_run {
                if let Some(parent) = dest.parent() {
                    p.fs.create_dir_all(parent).map_err(|e| fserr(parent, e))?;
                }
                p.fs.copy(&incoming, &dest).map_err(|e| fserr(&dest, e))?;
            }
        }

        Action::Delete => {
            if !p.dry_run {
                p.fs.remove_file(&dest).map_err(|e| fserr(&dest, e))?;
            }
        }

        // The user deleted the file; park the template's new version next
        // to where it would have gone.
        Action::DeleteEditConflict => {
            let inc_rel = format!("{rel}{SUFFIX_LOCALLY_DELETED}");
            let inc_abs = p.installed_dir.join(&inc_rel);
            if !p.dry_run {
                if let Some(parent) = inc_abs.parent() {
                    p.fs.create_dir_all(parent).map_err(|e| fserr(parent, e))?;
                }
                p.fs.copy(&incoming, &inc_abs).map_err(|e| fserr(&inc_abs, e))?;
            }
            incoming_path = Some(inc_rel);
        }

        // The user edited a file the template wants gone; preserve their
        // copy under a suffix, then honor the deletion.
        Action::EditDeleteConflict => {
            let ours_rel = format!("{rel}{SUFFIX_WANT_TO_DELETE}");
            let ours_abs = p.installed_dir.join(&ours_rel);
            if !p.dry_run {
                p.fs.copy(&dest, &ours_abs).map_err(|e| fserr(&ours_abs, e))?;
                p.fs.remove_file(&dest).map_err(|e| fserr(&dest, e))?;
            }
            ours_path = Some(ours_rel);
        }

        // Both sides changed (or both added) the file; the user's version
        // stays canonical and the template's lands next to it.
        Action::EditEditConflict | Action::AddAddConflict => {
            let inc_rel = format!("{rel}{SUFFIX_FROM_NEW_TEMPLATE}");
            let inc_abs = p.installed_dir.join(&inc_rel);
            if !p.dry_run {
                if let Some(parent) = inc_abs.parent() {
                    p.fs.create_dir_all(parent).map_err(|e| fserr(parent, e))?;
                }
                p.fs.copy(&incoming, &inc_abs).map_err(|e| fserr(&inc_abs, e))?;
            }
            incoming_path = Some(inc_rel);
        }
    }

    Ok(ActionTaken {
        action,
        explanation: explanation.to_string(),
        path: rel.to_string(),
        ours_path,
        incoming_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsys::RealFs;
    use crate::manifest::{InputValue, LocationType, OutputFile};
    use chrono::{TimeZone, Utc};
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn manifest_of(entries: &[(&str, &str)]) -> Manifest {
        Manifest {
            api_version: "abc/v1".into(),
            kind: "TemplateManifest".into(),
            creation_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            modification_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            template_location: "../t".into(),
            location_type: LocationType::LocalGit,
            template_version: "v".into(),
            upgrade_channel: None,
            template_dirhash: "h1:eA==".into(),
            inputs: Vec::<InputValue>::new(),
            output_files: entries
                .iter()
                .map(|(path, hash)| OutputFile {
                    path: (*path).to_string(),
                    hash: (*hash).to_string(),
                    patch: None,
                })
                .collect(),
        }
    }

    struct Setup {
        _tmp: tempfile::TempDir,
        installed: PathBuf,
        merge: PathBuf,
        reversed: PathBuf,
    }

    fn setup() -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        let installed = tmp.path().join("installed");
        let merge = tmp.path().join("merge");
        let reversed = tmp.path().join("reversed");
        for d in [&installed, &merge, &reversed] {
            fs::create_dir_all(d).unwrap();
        }
        Setup {
            _tmp: tmp,
            installed,
            merge,
            reversed,
        }
    }

    fn hash_of_file(p: &Path) -> String {
        crate::hash::file_hash(p).unwrap()
    }

    fn run(s: &Setup, old: &Manifest, new: &Manifest, dry_run: bool) -> Vec<ActionTaken> {
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        execute_merge(&MergeParams {
            fs: &RealFs,
            old_manifest: old,
            new_manifest: new,
            installed_dir: &s.installed,
            merge_dir: &s.merge,
            reversed_dir: &s.reversed,
            cancel: &cancel,
            dry_run,
        })
        .unwrap()
    }

    #[test]
    fn test_write_new_file() {
        let s = setup();
        fs::write(s.merge.join("new.txt"), "fresh\n").unwrap();
        let old = manifest_of(&[]);
        let new = manifest_of(&[("new.txt", &hash_of_file(&s.merge.join("new.txt")))]);

        let taken = run(&s, &old, &new, false);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].action, Action::WriteNew);
        assert_eq!(
            fs::read_to_string(s.installed.join("new.txt")).unwrap(),
            "fresh\n"
        );
    }

    #[test]
    fn test_unchanged_template_file_keeps_local_edits() {
        let s = setup();
        // Template bytes identical across versions; the user edited theirs.
        fs::write(s.merge.join("f.txt"), "template\n").unwrap();
        fs::write(s.installed.join("f.txt"), "user edit\n").unwrap();
        let tpl_hash = hash_of_file(&s.merge.join("f.txt"));
        let old = manifest_of(&[("f.txt", &tpl_hash)]);
        let new = manifest_of(&[("f.txt", &tpl_hash)]);

        let taken = run(&s, &old, &new, false);
        assert_eq!(taken[0].action, Action::Noop);
        assert_eq!(
            fs::read_to_string(s.installed.join("f.txt")).unwrap(),
            "user edit\n"
        );
    }

    #[test]
    fn test_edit_edit_conflict_preserves_both() {
        let s = setup();
        fs::write(s.installed.join("f.txt"), "my edited contents").unwrap();
        fs::write(s.merge.join("f.txt"), "goodbye").unwrap();

        // Old manifest recorded the v1 render, which matches neither side.
        let old = manifest_of(&[("f.txt", "h1:bm90LXRoaXM=")]);
        let new = manifest_of(&[("f.txt", &hash_of_file(&s.merge.join("f.txt")))]);

        let taken = run(&s, &old, &new, false);
        assert_eq!(taken[0].action, Action::EditEditConflict);
        assert_eq!(
            taken[0].incoming_path.as_deref(),
            Some("f.txt.abcmerge_from_new_template")
        );
        assert_eq!(
            fs::read_to_string(s.installed.join("f.txt")).unwrap(),
            "my edited contents"
        );
        assert_eq!(
            fs::read_to_string(s.installed.join("f.txt.abcmerge_from_new_template")).unwrap(),
            "goodbye"
        );
    }

    #[test]
    fn test_user_delete_vs_template_delete() {
        let s = setup();
        // Neither the installed file nor the new render has it.
        let old = manifest_of(&[("gone.txt", "h1:eA==")]);
        let new = manifest_of(&[]);

        let taken = run(&s, &old, &new, false);
        assert_eq!(taken[0].action, Action::Noop);
    }

    #[test]
    fn test_edit_delete_conflict_moves_ours() {
        let s = setup();
        fs::write(s.installed.join("f.txt"), "precious edits\n").unwrap();
        let old = manifest_of(&[("f.txt", "h1:b2xkLXJlbmRlcg==")]);
        let new = manifest_of(&[]);

        let taken = run(&s, &old, &new, false);
        assert_eq!(taken[0].action, Action::EditDeleteConflict);
        assert_eq!(
            taken[0].ours_path.as_deref(),
            Some("f.txt.abcmerge_template_wants_to_delete")
        );
        assert!(!s.installed.join("f.txt").exists());
        assert_eq!(
            fs::read_to_string(
                s.installed.join("f.txt.abcmerge_template_wants_to_delete")
            )
            .unwrap(),
            "precious edits\n"
        );
    }

    #[test]
    fn test_delete_edit_conflict_parks_incoming() {
        let s = setup();
        // User deleted; the new template still changes the file.
        fs::write(s.merge.join("f.txt"), "new version\n").unwrap();
        let old = manifest_of(&[("f.txt", "h1:b2xkLXJlbmRlcg==")]);
        let new = manifest_of(&[("f.txt", &hash_of_file(&s.merge.join("f.txt")))]);

        let taken = run(&s, &old, &new, false);
        assert_eq!(taken[0].action, Action::DeleteEditConflict);
        assert_eq!(
            taken[0].incoming_path.as_deref(),
            Some("f.txt.abcmerge_locally_deleted_vs_new_template_version")
        );
        assert!(!s.installed.join("f.txt").exists());
        assert!(s
            .installed
            .join("f.txt.abcmerge_locally_deleted_vs_new_template_version")
            .exists());
    }

    #[test]
    fn test_add_add_conflict() {
        let s = setup();
        fs::write(s.installed.join("f.txt"), "mine\n").unwrap();
        fs::write(s.merge.join("f.txt"), "theirs\n").unwrap();
        let old = manifest_of(&[]);
        let new = manifest_of(&[("f.txt", &hash_of_file(&s.merge.join("f.txt")))]);

        let taken = run(&s, &old, &new, false);
        assert_eq!(taken[0].action, Action::AddAddConflict);
        assert_eq!(
            fs::read_to_string(s.installed.join("f.txt")).unwrap(),
            "mine\n"
        );
        assert_eq!(
            fs::read_to_string(s.installed.join("f.txt.abcmerge_from_new_template")).unwrap(),
            "theirs\n"
        );
    }

    #[test]
    fn test_include_from_destination_overwrites_despite_edits() {
        let s = setup();
        fs::write(s.installed.join("cfg.txt"), "user broke this\n").unwrap();
        fs::write(s.merge.join("cfg.txt"), "new render\n").unwrap();
        // Presence under reversed_dir marks include-from-destination.
        fs::write(s.reversed.join("cfg.txt"), "pre-edit content\n").unwrap();

        let old = manifest_of(&[("cfg.txt", "h1:b2xkLXJlbmRlcg==")]);
        let new = manifest_of(&[("cfg.txt", &hash_of_file(&s.merge.join("cfg.txt")))]);

        let taken = run(&s, &old, &new, false);
        assert_eq!(taken[0].action, Action::WriteNew);
        assert_eq!(
            fs::read_to_string(s.installed.join("cfg.txt")).unwrap(),
            "new render\n"
        );
    }

    #[test]
    fn test_dry_run_mutates_nothing() {
        let s = setup();
        fs::write(s.installed.join("del.txt"), "to be deleted\n").unwrap();
        fs::write(s.installed.join("edit.txt"), "user edit\n").unwrap();
        fs::write(s.merge.join("edit.txt"), "template edit\n").unwrap();
        fs::write(s.merge.join("new.txt"), "brand new\n").unwrap();

        let old = manifest_of(&[
            ("del.txt", &hash_of_file(&s.installed.join("del.txt"))),
            ("edit.txt", "h1:b2xkLXJlbmRlcg=="),
        ]);
        let new = manifest_of(&[
            ("edit.txt", &hash_of_file(&s.merge.join("edit.txt"))),
            ("new.txt", &hash_of_file(&s.merge.join("new.txt"))),
        ]);

        let dry = run(&s, &old, &new, true);
        assert_eq!(dry.len(), 3);

        // Nothing moved.
        assert!(s.installed.join("del.txt").exists());
        assert!(!s.installed.join("new.txt").exists());
        assert!(!s
            .installed
            .join("edit.txt.abcmerge_from_new_template")
            .exists());

        // The real run reports the same decisions and applies them.
        let real = run(&s, &old, &new, false);
        assert_eq!(dry, real);
        assert!(!s.installed.join("del.txt").exists());
        assert!(s.installed.join("new.txt").exists());
        assert!(s
            .installed
            .join("edit.txt.abcmerge_from_new_template")
            .exists());
    }

    #[test]
    fn test_results_sorted_by_path() {
        let s = setup();
        for name in ["z.txt", "a.txt", "m.txt"] {
            fs::write(s.merge.join(name), name).unwrap();
        }
        let old = manifest_of(&[]);
        let hashes: Vec<(String, String)> = ["z.txt", "a.txt", "m.txt"]
            .iter()
            .map(|n| ((*n).to_string(), hash_of_file(&s.merge.join(n))))
            .collect();
        let refs: Vec<(&str, &str)> = hashes
            .iter()
            .map(|(a, b)| (a.as_str(), b.as_str()))
            .collect();
        let new = manifest_of(&refs);

        let taken = run(&s, &old, &new, false);
        let paths: Vec<&str> = taken.iter().map(|t| t.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "m.txt", "z.txt"]);
    }

    #[test]
    fn test_cancelled_before_first_file() {
        let s = setup();
        fs::write(s.merge.join("f.txt"), "x").unwrap();
        let old = manifest_of(&[]);
        let new = manifest_of(&[("f.txt", &hash_of_file(&s.merge.join("f.txt")))]);

        let cancel: CancelFlag = Arc::new(AtomicBool::new(true));
        let err = execute_merge(&MergeParams {
            fs: &RealFs,
            old_manifest: &old,
            new_manifest: &new,
            installed_dir: &s.installed,
            merge_dir: &s.merge,
            reversed_dir: &s.reversed,
            cancel: &cancel,
            dry_run: false,
        })
        .unwrap_err();
        assert!(matches!(err, AbcError::Cancelled));
        assert!(!s.installed.join("f.txt").exists());
    }

    /// An Fs that refuses all writes, standing in for a full disk.
    struct ReadOnlyFs;
    impl Fs for ReadOnlyFs {
        fn open(&self, path: &Path) -> std::io::Result<Box<dyn std::io::Read>> {
            RealFs.open(path)
        }
        fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
            RealFs.read(path)
        }
        fn write(&self, _: &Path, _: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::other("write fault"))
        }
        fn copy(&self, _: &Path, _: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("copy fault"))
        }
        fn remove_file(&self, _: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("remove fault"))
        }
        fn rename(&self, _: &Path, _: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("rename fault"))
        }
        fn create_dir_all(&self, _: &Path) -> std::io::Result<()> {
            Err(std::io::Error::other("mkdir fault"))
        }
        fn exists(&self, path: &Path) -> bool {
            RealFs.exists(path)
        }
    }

    #[test]
    fn test_injected_fault_surfaces_in_real_run_only() {
        let s = setup();
        fs::write(s.merge.join("new.txt"), "fresh\n").unwrap();
        let old = manifest_of(&[]);
        let new = manifest_of(&[("new.txt", &hash_of_file(&s.merge.join("new.txt")))]);

        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let mut params = MergeParams {
            fs: &ReadOnlyFs,
            old_manifest: &old,
            new_manifest: &new,
            installed_dir: &s.installed,
            merge_dir: &s.merge,
            reversed_dir: &s.reversed,
            cancel: &cancel,
            dry_run: true,
        };

        // The dry run only reads, so the write fault never fires.
        execute_merge(&params).unwrap();

        params.dry_run = false;
        let err = execute_merge(&params).unwrap_err();
        assert!(matches!(err, AbcError::Filesystem { .. }));
    }

    #[test]
    fn test_conflict_suffixes_share_scan_prefix() {
        for s in [
            SUFFIX_LOCALLY_ADDED,
            SUFFIX_FROM_NEW_TEMPLATE,
            SUFFIX_LOCALLY_DELETED,
            SUFFIX_WANT_TO_DELETE,
        ] {
            assert!(s.starts_with(CONFLICT_SUFFIX_PREFIX));
        }
    }
}
