use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::AbcError;
use crate::manifest::{LocationType, Manifest};
use crate::pathutil;
use crate::template::TEMPLATE_FILE;

/// Directed dependency graph over the manifests selected for one run.
///
/// An edge `a → b` reads "a depends on b": `b` must be upgraded before `a`.
/// Nodes are inserted explicitly so isolated manifests still appear in the
/// sort output.
#[derive(Debug, Default)]
pub struct DepGraph {
    nodes: BTreeSet<PathBuf>,
    deps: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: PathBuf) {
        self.nodes.insert(node);
    }

    pub fn add_edge(&mut self, from: PathBuf, to: PathBuf) {
        self.nodes.insert(from.clone());
        self.nodes.insert(to.clone());
        self.deps.entry(from).or_default().insert(to);
    }

    /// The manifests `node` depends on (reported as `depended_on`).
    pub fn edges_from(&self, node: &Path) -> Vec<PathBuf> {
        self.deps
            .get(node)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Kahn's algorithm with a lexicographic tie-break, so identical inputs
    /// always produce the identical order. Cycles are reported by naming
    /// the nodes still unplaced.
    pub fn topological_sort(&self) -> Result<Vec<PathBuf>, AbcError> {
        let mut remaining_deps: BTreeMap<&PathBuf, BTreeSet<&PathBuf>> = self
            .nodes
            .iter()
            .map(|n| {
                let deps = self
                    .deps
                    .get(n)
                    .map(|s| s.iter().collect())
                    .unwrap_or_default();
                (n, deps)
            })
            .collect();

        let mut order: Vec<PathBuf> = Vec::with_capacity(self.nodes.len());
        loop {
            let ready: Vec<&PathBuf> = remaining_deps
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(n, _)| *n)
                .collect();
            if ready.is_empty() {
                break;
            }
            // BTreeMap iteration makes `ready` already lexicographic.
            for node in ready {
                remaining_deps.remove(node);
                for deps in remaining_deps.values_mut() {
                    deps.remove(node);
                }
                order.push(node.clone());
            }
        }

        if !remaining_deps.is_empty() {
            let cycle: Vec<PathBuf> = remaining_deps.keys().map(|n| (*n).clone()).collect();
            return Err(AbcError::CycleDetected(cycle));
        }
        Ok(order)
    }
}

/// One manifest as the graph builder sees it.
pub struct GraphEntry<'a> {
    /// Node identity: the manifest path relative to the crawl root.
    pub node: PathBuf,
    /// Absolute installation root (the manifest's grandparent).
    pub install_root: PathBuf,
    pub manifest: &'a Manifest,
}

/// Build the manifest-depends-on-manifest graph.
///
/// `m1` depends on `m2` when `m2` renders the template definition file that
/// `m1` was installed from: `m1.template_location`, resolved against `m1`'s
/// installation root, names a directory whose `template.yaml` is one of
/// `m2`'s outputs. Only `local_git` installations participate. When the
/// caller overrides the template location uniformly, all manifests are
/// independent and no edges exist.
pub fn dep_graph(entries: &[GraphEntry<'_>], location_override: bool) -> DepGraph {
    let mut graph = DepGraph::new();
    for e in entries {
        graph.add_node(e.node.clone());
    }
    if location_override {
        return graph;
    }

    // Absolute path of every template.yaml each manifest outputs.
    let mut def_outputs: Vec<(usize, PathBuf)> = Vec::new();
    for (i, e) in entries.iter().enumerate() {
        if e.manifest.location_type != LocationType::LocalGit {
            continue;
        }
        for out in &e.manifest.output_files {
            let is_def = Path::new(&out.path)
                .file_name()
                .map(|n| n == TEMPLATE_FILE)
                .unwrap_or(false);
            if is_def {
                let abs = pathutil::lexical_normalize(&e.install_root.join(&out.path));
                def_outputs.push((i, abs));
            }
        }
    }

    for (i, e) in entries.iter().enumerate() {
        if e.manifest.location_type != LocationType::LocalGit {
            continue;
        }
        let loc = Path::new(&e.manifest.template_location);
        let template_dir = if loc.is_absolute() {
            loc.to_path_buf()
        } else {
            e.install_root.join(loc)
        };
        let wanted = pathutil::lexical_normalize(&template_dir.join(TEMPLATE_FILE));

        for (j, def_abs) in &def_outputs {
            if *j != i && *def_abs == wanted {
                graph.add_edge(e.node.clone(), entries[*j].node.clone());
            }
        }
    }
    graph
}
