// src/config.rs

//! Configuration for the index and the merge engine
//!
//! - `index.conf`: the small key/value file at the top of an index
//! - [`ConfigProtect`]: which root paths must not be silently overwritten
//! - [`EngineConfig`]: a serde-loadable bundle of the above plus merge options

use crate::error::{Error, IoContext, Result};
use crate::merger::MergeOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the format file at the top of an index
pub const INDEX_CONF: &str = "index.conf";

/// The only index layout version we understand
pub const INDEX_FORMAT: &str = "1";

/// Environment variable that forces `no_chown` when non-empty
pub const NO_CHOWN_ENV: &str = "INSTALLDB_NO_CHOWN";

/// Contents of `index.conf`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConfig {
    pub format: String,
    pub repository_format: String,
}

impl IndexConfig {
    pub fn new(repository_format: &str) -> Self {
        Self {
            format: INDEX_FORMAT.to_string(),
            repository_format: repository_format.to_string(),
        }
    }

    /// Parse `key = value` lines; blank lines and `#` comments are ignored
    pub fn parse(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("line {} of {} is not 'key = value'", lineno + 1, INDEX_CONF))
            })?;
            values.insert(key.trim().to_string(), value.trim().to_string());
        }

        let mut take = |key: &str| {
            values
                .remove(key)
                .ok_or_else(|| Error::Config(format!("{} has no '{}' key", INDEX_CONF, key)))
        };

        Ok(Self {
            format: take("format")?,
            repository_format: take("repository_format")?,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).at(path)?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        debug!("Writing index configuration to {}", path.display());
        fs::write(path, self.to_string()).at(path)
    }
}

impl std::fmt::Display for IndexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "format = {}", self.format)?;
        writeln!(f, "repository_format = {}", self.repository_format)
    }
}

/// Configuration protection rules
///
/// A root-relative path is protected if it equals, or lies beneath, any
/// protect entry and does not equal, or lie beneath, any mask entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigProtect {
    #[serde(default)]
    pub protect: Vec<String>,
    #[serde(default)]
    pub mask: Vec<String>,
}

impl ConfigProtect {
    /// Build from whitespace-separated lists, as found in `CONFIG_PROTECT`
    pub fn from_lists(protect: &str, mask: &str) -> Self {
        Self {
            protect: protect.split_whitespace().map(str::to_string).collect(),
            mask: mask.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Merge another rule set into this one
    pub fn extend(&mut self, other: &ConfigProtect) {
        self.protect.extend(other.protect.iter().cloned());
        self.mask.extend(other.mask.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.protect.is_empty()
    }

    /// `tidy` is the path relative to the root, with a leading `/`
    pub fn is_protected(&self, tidy: &str) -> bool {
        let matches = |prefix: &String| {
            let dir = format!("{}/", prefix.trim_end_matches('/'));
            tidy == prefix || tidy.starts_with(&dir)
        };

        self.protect.iter().any(matches) && !self.mask.iter().any(matches)
    }
}

/// Everything needed to open an index and merge into a root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Location of the index (the directory holding `index.conf`)
    pub location: PathBuf,

    /// Root that images are merged onto
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Written to `index.conf` when creating a new index, and required to
    /// match when opening an existing one
    #[serde(default = "default_repository_format")]
    pub repository_format: String,

    #[serde(default)]
    pub config_protect: ConfigProtect,

    #[serde(default)]
    pub merge_options: MergeOptions,
}

fn default_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_repository_format() -> String {
    "installdb".to_string()
}

impl EngineConfig {
    pub fn new(location: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            root: root.into(),
            repository_format: default_repository_format(),
            config_protect: ConfigProtect::default(),
            merge_options: MergeOptions::default(),
        }
    }

    /// Load from a JSON file, then apply environment overrides
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).at(path)?;
        let mut config: EngineConfig = serde_json::from_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// `INSTALLDB_NO_CHOWN` forces ownership changes off
    pub fn apply_env(&mut self) {
        if std::env::var_os(NO_CHOWN_ENV).is_some_and(|v| !v.is_empty()) {
            debug!("{} set, disabling ownership changes", NO_CHOWN_ENV);
            self.merge_options.no_chown = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_config_parse() {
        let conf = IndexConfig::parse("# comment\nformat = 1\n\nrepository_format = exheres\n").unwrap();
        assert_eq!(conf.format, "1");
        assert_eq!(conf.repository_format, "exheres");
    }

    #[test]
    fn test_index_config_missing_key() {
        let result = IndexConfig::parse("format = 1\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_index_config_malformed_line() {
        let result = IndexConfig::parse("format 1\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_index_config_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(INDEX_CONF);
        IndexConfig::new("test").save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "format = 1\nrepository_format = test\n");
        assert_eq!(IndexConfig::load(&path).unwrap(), IndexConfig::new("test"));
    }

    #[test]
    fn test_config_protect_prefixes() {
        let cp = ConfigProtect::from_lists("/etc /usr/share/config/", "/etc/env.d");

        assert!(cp.is_protected("/etc"));
        assert!(cp.is_protected("/etc/foo.conf"));
        assert!(cp.is_protected("/usr/share/config/kde"));
        assert!(!cp.is_protected("/etcetera/foo"));
        assert!(!cp.is_protected("/etc/env.d"));
        assert!(!cp.is_protected("/etc/env.d/00basic"));
        assert!(!cp.is_protected("/usr/bin/ls"));
    }

    #[test]
    fn test_config_protect_empty() {
        let cp = ConfigProtect::default();
        assert!(cp.is_empty());
        assert!(!cp.is_protected("/etc/passwd"));
    }

    #[test]
    fn test_engine_config_from_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(
            &path,
            r#"{
                "location": "/var/db/installed",
                "config_protect": { "protect": ["/etc"] },
                "merge_options": { "rewrite_symlinks": true }
            }"#,
        )
        .unwrap();

        let config = EngineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.location, PathBuf::from("/var/db/installed"));
        assert_eq!(config.root, PathBuf::from("/"));
        assert_eq!(config.repository_format, "installdb");
        assert!(config.config_protect.is_protected("/etc/hosts"));
        assert!(config.merge_options.rewrite_symlinks);
        assert!(!config.merge_options.allow_empty_dirs);
    }
}
