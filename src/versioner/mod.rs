//! Pluggable archival of files the puller is about to delete or
//! overwrite. When a repository configures a versioner, displaced content
//! moves into the reserved `.stversions` subtree instead of disappearing.

use std::collections::HashMap;
use std::path::Path;

pub mod simple;

/// Name of the reserved archive subtree inside a repository. Skipped by
/// the directory fixup pass.
pub const VERSIONS_DIR: &str = ".stversions";

pub trait Versioner: Send + Sync {
    /// Moves `path` out of the live tree into the archive. Archiving a
    /// path that no longer exists succeeds.
    fn archive(&self, path: &Path) -> std::io::Result<()>;
}

/// Resolves the configured versioning type. An empty type means no
/// versioner; an unknown type is a configuration error.
pub fn factory(
    kind: &str,
    params: &HashMap<String, String>,
    repo_dir: &Path,
) -> anyhow::Result<Option<Box<dyn Versioner>>> {
    match kind {
        "" => Ok(None),
        "simple" => Ok(Some(Box::new(simple::SimpleVersioner::new(
            repo_dir, params,
        )))),
        other => anyhow::bail!("requested versioning type {other:?} does not exist"),
    }
}
