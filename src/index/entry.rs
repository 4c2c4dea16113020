// src/index/entry.rs

//! Index entries and the lazily loaded package metadata behind them

use crate::contents::CONTENTS_FILE;
use crate::error::{Error, IoContext, Result};
use crate::name::{QualifiedName, SlotName};
use crate::version::VersionSpec;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// One installed version of a package
#[derive(Debug)]
pub struct IndexEntry {
    pub name: QualifiedName,
    pub version: VersionSpec,
    pub slot: SlotName,
    /// Opaque tag distinguishing otherwise identical installs
    pub magic: String,
    /// The version directory under `data/`
    pub fs_location: PathBuf,
    package: Mutex<Option<Arc<InstalledPackage>>>,
}

impl IndexEntry {
    pub fn new(
        name: QualifiedName,
        version: VersionSpec,
        slot: SlotName,
        magic: impl Into<String>,
        fs_location: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name,
            version,
            slot,
            magic: magic.into(),
            fs_location: fs_location.into(),
            package: Mutex::new(None),
        }
    }

    /// Decode a version directory basename of the form `version:slot:magic`
    pub fn from_dir_name(name: QualifiedName, fs_location: &Path) -> Result<Self> {
        let basename = fs_location
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidName(format!("'{}' has no usable basename", fs_location.display())))?;

        let tokens: Vec<&str> = basename.split(':').collect();
        if tokens.len() < 3 {
            return Err(Error::InvalidName(format!(
                "'{}' should be of the form version:slot:magic",
                basename
            )));
        }

        Ok(Self::new(
            name,
            tokens[0].parse()?,
            tokens[1].parse()?,
            tokens[2],
            fs_location,
        ))
    }

    /// The basename this entry would be stored under
    pub fn dir_name(&self) -> String {
        format!("{}:{}:{}", self.version, self.slot, self.magic)
    }

    pub fn contents_path(&self) -> PathBuf {
        self.fs_location.join(CONTENTS_FILE)
    }

    /// Package metadata, read from disk on first use
    pub fn package(&self) -> Result<Arc<InstalledPackage>> {
        let mut guard = self.package.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(package) = guard.as_ref() {
            return Ok(Arc::clone(package));
        }

        let package = Arc::new(InstalledPackage::load(&self.fs_location)?);
        *guard = Some(Arc::clone(&package));
        Ok(package)
    }
}

/// Metadata keys stored as small files next to `contents`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledPackage {
    keys: BTreeMap<String, String>,
}

impl InstalledPackage {
    /// Every regular file other than `contents` becomes a key
    pub fn load(dir: &Path) -> Result<Self> {
        debug!("Loading package metadata from {}", dir.display());
        let mut keys = BTreeMap::new();

        for entry in fs::read_dir(dir).at(dir)? {
            let entry = entry.at(dir)?;
            let path = entry.path();
            let Some(key) = entry.file_name().to_str().map(str::to_string) else {
                warn!(tag = "index.metadata.skipping", "Skipping non-UTF-8 key file {}", path.display());
                continue;
            };
            if key == CONTENTS_FILE || key.starts_with('-') || !entry.file_type().at(&path)?.is_file() {
                continue;
            }

            let value = fs::read_to_string(&path).at(&path)?;
            keys.insert(key, value.trim_end().to_string());
        }

        Ok(Self { keys })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.keys.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}
