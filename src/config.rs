use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_log_level() -> String {
    "info".to_string()
}
fn default_rescan_interval_s() -> u64 {
    60
}
fn default_pull_slots() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub options: OptionsConfig,
    pub repositories: Vec<RepositoryConfig>,
}

impl Config {
    /// Loads the configuration file, falling back to defaults when it
    /// does not exist yet.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&raw)?)
    }

    pub async fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let tmp_path = {
            let mut s = path.as_os_str().to_os_string();
            s.push(".tmp");
            PathBuf::from(s)
        };
        let toml = toml::to_string_pretty(self)?;

        tokio::fs::write(&tmp_path, toml).await?;
        tokio::fs::rename(&tmp_path, path).await?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionsConfig {
    /// Seconds between automatic rescans of each repository.
    pub rescan_interval_s: u64,
    /// Concurrent in-flight block operations per repository. Zero means
    /// the repository is handled read-only.
    pub pull_slots: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub id: String,
    pub directory: PathBuf,
    pub read_only: bool,
    /// When set, neither file nor directory mode bits are applied or
    /// restored.
    pub ignore_perms: bool,
    pub versioning: VersioningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub params: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            options: OptionsConfig::default(),
            repositories: Vec::new(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            rescan_interval_s: default_rescan_interval_s(),
            pull_slots: default_pull_slots(),
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            directory: PathBuf::new(),
            read_only: false,
            ignore_perms: false,
            versioning: VersioningConfig::default(),
        }
    }
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            kind: String::new(),
            params: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-sync-config-{tag}-{nanos}"));
        p
    }

    #[test]
    fn defaults_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "info");
        assert_eq!(cfg.options.rescan_interval_s, 60);
        assert_eq!(cfg.options.pull_slots, 8);
        assert!(cfg.repositories.is_empty());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [[repositories]]
            id = "default"
            directory = "/srv/sync/default"

            [repositories.versioning]
            type = "simple"
            params = { keep = "3" }
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.options.pull_slots, 8);
        assert_eq!(cfg.repositories.len(), 1);
        let repo = &cfg.repositories[0];
        assert_eq!(repo.id, "default");
        assert!(!repo.read_only);
        assert_eq!(repo.versioning.kind, "simple");
        assert_eq!(repo.versioning.params.get("keep").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn persist_and_load_roundtrip() {
        let root = temp_dir("roundtrip");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let path = root.join("config.toml");

        let mut cfg = Config::default();
        cfg.options.pull_slots = 4;
        cfg.repositories.push(RepositoryConfig {
            id: "music".to_string(),
            directory: PathBuf::from("/srv/music"),
            read_only: true,
            ignore_perms: true,
            versioning: VersioningConfig::default(),
        });
        cfg.persist(&path).await.expect("persist");

        let loaded = Config::load(&path).await.expect("load");
        assert_eq!(loaded.options.pull_slots, 4);
        assert_eq!(loaded.repositories.len(), 1);
        assert!(loaded.repositories[0].read_only);

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn load_of_missing_file_is_default() {
        let root = temp_dir("missing");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let loaded = Config::load(&root.join("nope.toml")).await.expect("load");
        assert!(loaded.repositories.is_empty());
        let _ = std::fs::remove_dir_all(root);
    }
}
