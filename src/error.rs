use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbcError {
    #[error("no template manifests found under {}", .0.display())]
    NoManifestsFound(PathBuf),

    #[error("malformed manifest {}: {reason}", .path.display())]
    MalformedManifest { path: PathBuf, reason: String },

    #[error(
        "installation {} has no recorded template location; \
         pass --template-location to supply one",
        .0.display()
    )]
    NonCanonicalInstallation(PathBuf),

    #[error("download failed for {}: {reason}", .manifest.display())]
    DownloadFailure {
        manifest: PathBuf,
        reason: anyhow::Error,
    },

    #[error("render failed for {}: {reason}", .manifest.display())]
    RenderFailure {
        manifest: PathBuf,
        reason: anyhow::Error,
    },

    #[error("dependency cycle among manifests: {}", format_paths(.0))]
    CycleDetected(Vec<PathBuf>),

    #[error("--resume-from manifest {} is not among the selected manifests", .0.display())]
    ResumeNotFound(PathBuf),

    #[error("filesystem error on {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(
        "unresolved conflicts from a previous upgrade remain under {}: {}; \
         resolve them and delete the marker files before upgrading again",
        .root.display(),
        format_paths(.paths)
    )]
    ResidualConflicts { root: PathBuf, paths: Vec<PathBuf> },

    #[error(
        "patch tool exited with unexpected status {status} for {}: {stderr}",
        .path.display()
    )]
    PatchToolFailure {
        path: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("filter expression error: {0}")]
    FilterExpr(String),

    #[error(
        "internal invariant violated ({0}); this is a bug in abc, please report it \
         along with this message"
    )]
    InternalInvariantViolated(String),

    #[error("upgrade interrupted")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
