use std::fmt;

use serde::Serialize;

use crate::error::AbcError;
use crate::hash::HashResult;

/// Everything the merge can do with one file. Closed set; the decision
/// function is exhaustive over it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    WriteNew,
    Delete,
    Noop,
    AddAddConflict,
    EditEditConflict,
    EditDeleteConflict,
    DeleteEditConflict,
}

impl Action {
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Action::AddAddConflict
                | Action::EditEditConflict
                | Action::EditDeleteConflict
                | Action::DeleteEditConflict
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::WriteNew => "write",
            Action::Delete => "delete",
            Action::Noop => "noop",
            Action::AddAddConflict => "add/add conflict",
            Action::EditEditConflict => "edit/edit conflict",
            Action::EditDeleteConflict => "edit/delete conflict",
            Action::DeleteEditConflict => "delete/edit conflict",
        };
        write!(f, "{s}")
    }
}

/// Evidence collected by the merge executor for one file.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub rel_path: &'a str,
    pub is_in_old: bool,
    pub is_in_new: bool,
    /// Installed file vs the hash the old manifest recorded for it.
    pub old_file_matches_old_hash: HashResult,
    /// Newly rendered file vs the old manifest's hash.
    pub new_file_matches_old_hash: HashResult,
    /// Installed file vs the hash the new manifest recorded.
    pub old_file_matches_new_hash: HashResult,
    pub is_included_from_destination: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub explanation: &'static str,
}

fn decision(action: Action, explanation: &'static str) -> Result<Decision, AbcError> {
    Ok(Decision {
        action,
        explanation,
    })
}

/// Decide what to do with one file, given only hash evidence.
///
/// Pure: same inputs, same output, no filesystem access. Include-from-
/// destination files are treated as template-owned for deletion even when
/// locally edited; that asymmetry with the edit/delete path is deliberate
/// and preserved from the engine's original behavior.
pub fn decide(inp: &DecisionInput<'_>) -> Result<Decision, AbcError> {
    use HashResult::{Absent, Match, Mismatch};

    match (inp.is_in_old, inp.is_in_new) {
        // File newly added by the template.
        (false, true) => match inp.old_file_matches_new_hash {
            Match => decision(
                Action::Noop,
                "the new template version adds this file, but an identical file already exists",
            ),
            Mismatch => decision(
                Action::AddAddConflict,
                "the new template version adds this file, but you already have a different file by that name",
            ),
            Absent => decision(Action::WriteNew, "the new template version adds this file"),
        },

        // The template no longer outputs this file.
        (true, false) => {
            if inp.old_file_matches_old_hash == Match || inp.is_included_from_destination {
                decision(
                    Action::Delete,
                    "the new template version no longer outputs this file",
                )
            } else {
                match inp.old_file_matches_old_hash {
                    Mismatch => decision(
                        Action::EditDeleteConflict,
                        "you edited this file, but the new template version wants to remove it",
                    ),
                    Absent => decision(
                        Action::Noop,
                        "you deleted this file, and the new template version no longer outputs it",
                    ),
                    Match => unreachable_inputs(inp),
                }
            }
        }

        // Both template versions output the file.
        (true, true) => {
            if inp.new_file_matches_old_hash == Match {
                return decision(
                    Action::Noop,
                    "the template's version of this file is unchanged, so your copy is kept",
                );
            }
            if inp.old_file_matches_old_hash == Match || inp.is_included_from_destination {
                return decision(
                    Action::WriteNew,
                    "the new template version updates this file",
                );
            }
            match inp.old_file_matches_old_hash {
                Mismatch => decision(
                    Action::EditEditConflict,
                    "you edited this file, and the new template version also changes it",
                ),
                Absent => decision(
                    Action::DeleteEditConflict,
                    "you deleted this file, but the new template version changes it",
                ),
                Match => unreachable_inputs(inp),
            }
        }

        // A file in neither manifest cannot be in the union.
        (false, false) => unreachable_inputs(inp),
    }
}

fn unreachable_inputs(inp: &DecisionInput<'_>) -> Result<Decision, AbcError> {
    Err(AbcError::InternalInvariantViolated(format!(
        "merge decision fell through for {:?}: \
         is_in_old={} is_in_new={} old_vs_old={:?} new_vs_old={:?} old_vs_new={:?} ifd={}",
        inp.rel_path,
        inp.is_in_old,
        inp.is_in_new,
        inp.old_file_matches_old_hash,
        inp.new_file_matches_old_hash,
        inp.old_file_matches_new_hash,
        inp.is_included_from_destination,
    )))
}
