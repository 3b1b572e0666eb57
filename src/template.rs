use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context as _};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::AbcError;
use crate::pathutil;

/// Name of the template definition file at the root of a template source
/// tree. Also the file the dependency graph looks for among rendered
/// outputs: a template that renders another template's definition must be
/// upgraded first.
pub const TEMPLATE_FILE: &str = "template.yaml";

/// Parsed `template.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDef {
    #[serde(alias = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One declared template input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Copy paths from the template tree into the output, rendering file
    /// bodies against the inputs.
    Include(IncludeStep),
    /// Include-from-destination: transform a file that already exists in
    /// the installation, recording a reversal patch.
    Edit(EditStep),
}

/// Manual `Deserialize` for `Step`.
///
/// serde_yaml's externally-tagged enum support expects a YAML `!Tag`, not
/// the `{include: {...}}` / `{edit: {...}}` mapping the spec's
/// `template.yaml` format uses, so the derive can't parse it. This matches
/// on the single mapping key by hand instead.
impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: serde_yaml::Value = Deserialize::deserialize(deserializer)?;
        let map = value
            .as_mapping()
            .ok_or_else(|| de::Error::custom("expected a step map with key 'include' or 'edit'"))?;
        if let Some(v) = map.get("include") {
            let inc: IncludeStep = serde_yaml::from_value(v.clone()).map_err(de::Error::custom)?;
            return Ok(Step::Include(inc));
        }
        if let Some(v) = map.get("edit") {
            let e: EditStep = serde_yaml::from_value(v.clone()).map_err(de::Error::custom)?;
            return Ok(Step::Edit(e));
        }
        Err(de::Error::custom(
            "expected a step map with key 'include' or 'edit'",
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncludeStep {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditStep {
    pub path: String,
    pub replace: Vec<Replacement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replacement {
    /// Literal text to find in the destination file.
    pub from: String,
    /// Replacement, rendered against the inputs before substitution.
    pub to: String,
}

/// Load and validate the template definition from a template source tree.
pub fn load_template(template_dir: &Path) -> Result<TemplateDef, AbcError> {
    let path = template_dir.join(TEMPLATE_FILE);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading template definition {}", path.display()))?;
    let def: TemplateDef = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing template definition {}", path.display()))?;

    for step in &def.steps {
        match step {
            Step::Include(inc) => {
                for p in &inc.paths {
                    if !pathutil::is_safe_rel(p) {
                        return Err(anyhow!("unsafe include path {p:?} in {}", path.display()).into());
                    }
                }
            }
            Step::Edit(edit) => {
                if !pathutil::is_safe_rel(&edit.path) {
                    return Err(anyhow!(
                        "unsafe edit path {:?} in {}",
                        edit.path,
                        path.display()
                    )
                    .into());
                }
            }
        }
    }
    Ok(def)
}
