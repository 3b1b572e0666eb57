use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context as _};

use crate::error::AbcError;
use crate::manifest::InputValue;
use crate::template::InputDecl;

/// Asks the user for a missing input. Kept behind a trait so resolution is
/// testable without a TTY.
pub trait Prompter {
    fn ask(&self, name: &str, description: &str) -> Result<String, anyhow::Error>;
}

/// Interactive prompter for the CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct TtyPrompter;

impl Prompter for TtyPrompter {
    fn ask(&self, name: &str, description: &str) -> Result<String, anyhow::Error> {
        let message = format!("{name}:");
        let mut q = inquire::Text::new(&message);
        if !description.is_empty() {
            q = q.with_help_message(description);
        }
        q.prompt()
            .with_context(|| format!("prompting for input {name:?}"))
    }
}

pub struct ResolveParams<'a> {
    /// `--input K=V` flags; strongest precedence.
    pub flag_inputs: &'a BTreeMap<String, String>,
    /// `--input-file` YAML maps; later files win over earlier ones.
    pub input_files: &'a [PathBuf],
    /// Present only in prompt mode.
    pub prompter: Option<&'a dyn Prompter>,
    /// Accept unknown keys and leave missing inputs empty.
    pub skip_validation: bool,
}

/// Resolve the values for a template's declared inputs.
///
/// Precedence: flags, then input files (later over earlier), then declared
/// defaults, then the prompter. Unknown keys and unresolvable inputs are
/// errors unless `skip_validation`. Output order is declaration order,
/// with any accepted extra keys sorted after.
pub fn resolve_inputs(
    decls: &[InputDecl],
    params: &ResolveParams<'_>,
) -> Result<Vec<InputValue>, AbcError> {
    let mut provided: BTreeMap<String, String> = BTreeMap::new();
    for file in params.input_files {
        let text = fs::read_to_string(file).map_err(|e| AbcError::Filesystem {
            path: file.clone(),
            source: e,
        })?;
        let map: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing input file {}", file.display()))?;
        for (k, v) in map {
            provided.insert(k, yaml_scalar_to_string(&v)?);
        }
    }
    for (k, v) in params.flag_inputs {
        provided.insert(k.clone(), v.clone());
    }

    let declared: BTreeSet<&str> = decls.iter().map(|d| d.name.as_str()).collect();
    let unknown: Vec<&String> = provided
        .keys()
        .filter(|k| !declared.contains(k.as_str()))
        .collect();
    if !unknown.is_empty() && !params.skip_validation {
        return Err(anyhow!(
            "unknown input(s) {}; the template declares: {}",
            unknown
                .iter()
                .map(|k| format!("{k:?}"))
                .collect::<Vec<_>>()
                .join(", "),
            decls
                .iter()
                .map(|d| d.name.clone())
                .collect::<Vec<_>>()
                .join(", ")
        )
        .into());
    }

    let mut resolved = Vec::with_capacity(decls.len());
    for decl in decls {
        let value = match provided.remove(&decl.name) {
            Some(v) => v,
            None => match &decl.default {
                Some(d) => d.clone(),
                None => match params.prompter {
                    Some(p) => p.ask(&decl.name, &decl.description)?,
                    None if params.skip_validation => String::new(),
                    None => {
                        return Err(anyhow!(
                            "missing required input {:?}; pass --input {}=... or --prompt",
                            decl.name,
                            decl.name
                        )
                        .into())
                    }
                },
            },
        };
        resolved.push(InputValue {
            name: decl.name.clone(),
            value,
        });
    }

    // Whatever remains is unknown but accepted under skip_validation.
    for (name, value) in provided {
        resolved.push(InputValue { name, value });
    }
    Ok(resolved)
}

fn yaml_scalar_to_string(v: &serde_yaml::Value) -> Result<String, AbcError> {
    use serde_yaml::Value;
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(anyhow!("input values must be scalars, got {other:?}").into()),
    }
}
