use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::VERSIONS_DIR;

const DEFAULT_KEEP: usize = 5;

/// Moves displaced files into `.stversions`, preserving their
/// repo-relative path and tagging each archived copy with the archival
/// time. Keeps the newest `keep` copies per file.
pub struct SimpleVersioner {
    repo_dir: PathBuf,
    versions_dir: PathBuf,
    keep: usize,
}

impl SimpleVersioner {
    pub fn new(repo_dir: &Path, params: &HashMap<String, String>) -> Self {
        let keep = params
            .get("keep")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_KEEP);
        Self {
            repo_dir: repo_dir.to_path_buf(),
            versions_dir: repo_dir.join(VERSIONS_DIR),
            keep,
        }
    }

    fn prune(&self, dir: &Path, file_name: &str) -> std::io::Result<()> {
        let prefix = format!("{file_name}~");
        let mut versions: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect();
        if versions.len() <= self.keep {
            return Ok(());
        }
        // Tags are zero-padded unix seconds, so the lexical order is the
        // chronological order.
        versions.sort();
        for old in &versions[..versions.len() - self.keep] {
            if let Err(err) = std::fs::remove_file(old) {
                tracing::warn!(path = %old.display(), error = %err, "pruning archived version failed");
            }
        }
        Ok(())
    }
}

impl super::Versioner for SimpleVersioner {
    fn archive(&self, path: &Path) -> std::io::Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let rel = path.strip_prefix(&self.repo_dir).map_err(|_| {
            std::io::Error::other(format!(
                "path '{}' is outside repository '{}'",
                path.display(),
                self.repo_dir.display()
            ))
        })?;
        let file_name = rel
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| std::io::Error::other("path has no file name"))?
            .to_string();

        let target_dir = match rel.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => self.versions_dir.join(parent),
            _ => self.versions_dir.clone(),
        };
        std::fs::create_dir_all(&target_dir)?;

        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut target = target_dir.join(format!("{file_name}~{secs:010}"));
        let mut counter = 1u32;
        while target.exists() {
            target = target_dir.join(format!("{file_name}~{secs:010}.{counter}"));
            counter += 1;
        }

        tracing::debug!(from = %path.display(), to = %target.display(), "archiving displaced file");
        std::fs::rename(path, &target)?;
        self.prune(&target_dir, &file_name)
    }
}
