// src/repository/mod.rs

//! Installed package repository
//!
//! This module ties the engines together:
//! - Allocating a version directory for each install
//! - Checking, then merging an image and registering it in the index
//! - Replacing an already installed package of the same version and slot
//! - Uninstalling and deindexing

use crate::config::EngineConfig;
use crate::contents::{ContentsEntry, CONTENTS_FILE};
use crate::error::{Error, IoContext, Result};
use crate::index::{ContentIndex, IndexEntry};
use crate::merger::{self, MergeParams, MergeTarget};
use crate::name::{QualifiedName, SlotName};
use crate::unmerger::{self, UnmergeReport};
use crate::version::VersionSpec;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// A built image waiting to be installed
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub name: QualifiedName,
    pub version: VersionSpec,
    pub slot: SlotName,
    /// Distinguishes this install; a cookie is generated when absent
    pub magic: Option<String>,
    pub image: PathBuf,
    /// Written as key files next to `contents`
    pub metadata: BTreeMap<String, String>,
    pub fix_mtimes_before: Option<SystemTime>,
}

impl InstallRequest {
    pub fn new(name: QualifiedName, version: VersionSpec, slot: SlotName, image: impl Into<PathBuf>) -> Self {
        Self {
            name,
            version,
            slot,
            magic: None,
            image: image.into(),
            metadata: BTreeMap::new(),
            fix_mtimes_before: None,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

static COOKIE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `<unix-seconds>-<pid>-<n>`, unique within this process
fn make_cookie() -> String {
    let n = COOKIE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", chrono::Utc::now().timestamp(), std::process::id(), n)
}

fn validate_metadata_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key != CONTENTS_FILE
        && !key.starts_with('-')
        && !key.starts_with('.')
        && !key.contains('/');
    if valid {
        Ok(())
    } else {
        Err(Error::Merge(format!("'{}' cannot be used as a metadata key", key)))
    }
}

/// The installed packages under one root
pub struct InstalledRepository {
    config: EngineConfig,
    index: ContentIndex,
}

impl InstalledRepository {
    /// Open (or create) the index named by `config`
    pub fn open(config: EngineConfig) -> Result<Self> {
        let wanted = config.repository_format.clone();
        let index = ContentIndex::open(&config.location, |f| f == wanted, &config.repository_format)?;
        info!(
            "Opened installed repository at {} for root {}",
            config.location.display(),
            config.root.display()
        );
        Ok(Self { config, index })
    }

    pub fn index(&self) -> &ContentIndex {
        &self.index
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Merge parameters built from the configuration
    pub fn merge_params(&self) -> MergeParams {
        MergeParams::new(self.config.merge_options.clone()).with_config_protect(self.config.config_protect.clone())
    }

    /// Installed versions of a package, ascending
    pub fn installed(&self, q: &QualifiedName) -> Result<Arc<Vec<Arc<IndexEntry>>>> {
        self.index.entries(q)
    }

    /// Install with parameters derived from the configuration
    pub fn install(&self, request: &InstallRequest) -> Result<IndexEntry> {
        let mut params = self.merge_params();
        params.fix_mtimes_before = request.fix_mtimes_before;
        self.install_with(request, &params)
    }

    /// Check, merge and register an image, replacing any installed package
    /// with the same version and slot
    pub fn install_with(&self, request: &InstallRequest, params: &MergeParams) -> Result<IndexEntry> {
        let q = &request.name;
        info!("Installing {}-{}:{}", q, request.version, request.slot);

        let existing = self.index.entries(q)?;
        let data_dir = existing
            .first()
            .and_then(|e| e.fs_location.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.index.data_dir(q));
        let replacing = existing
            .iter()
            .find(|e| e.version == request.version && e.slot == request.slot)
            .cloned();

        for key in request.metadata.keys() {
            validate_metadata_key(key)?;
        }

        let magic = request.magic.clone().unwrap_or_else(make_cookie);
        let version_dir = data_dir.join(format!("{}:{}:{}", request.version, request.slot, magic));
        if fs::symlink_metadata(&version_dir).is_ok() {
            return Err(Error::Merge(format!(
                "Temporary merge directory '{}' already exists, probably due to a previous failed merge",
                version_dir.display()
            )));
        }
        fs::create_dir_all(&version_dir).at(&version_dir)?;

        let prepared = self.prepare(request, params, &version_dir);
        if let Err(e) = prepared {
            if let Err(cleanup) = fs::remove_dir_all(&version_dir) {
                warn!(
                    tag = "repository.cleanup",
                    "Could not remove {}: {}",
                    version_dir.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        let target = MergeTarget {
            name: q.clone(),
            version_dir,
        };
        let entry = merger::merge(&request.image, &self.config.root, params, &self.index, &target)?;

        if let Some(old) = replacing {
            let owned = self.owned_paths(&entry)?;
            debug!("Replacing {} ({} paths reinstalled)", old.fs_location.display(), owned.len());
            self.uninstall_keeping(&old, &owned)?;
        }

        Ok(entry)
    }

    /// Write metadata and run the pre-merge check
    fn prepare(&self, request: &InstallRequest, params: &MergeParams, version_dir: &Path) -> Result<()> {
        for (key, value) in &request.metadata {
            let path = version_dir.join(key);
            fs::write(&path, format!("{}\n", value)).at(&path)?;
        }

        let report = merger::check(&request.image, &self.config.root, params)?;
        if report.is_clean() {
            Ok(())
        } else {
            Err(Error::Conflict(report))
        }
    }

    fn owned_paths(&self, entry: &IndexEntry) -> Result<HashSet<PathBuf>> {
        let mut entries: Vec<ContentsEntry> = Vec::new();
        self.index.parse_contents(entry, &mut entries)?;
        Ok(entries.iter().map(|e| e.path().to_path_buf()).collect())
    }

    /// Remove an installed package from the root and the index
    pub fn uninstall(&self, entry: &IndexEntry) -> Result<UnmergeReport> {
        unmerger::unmerge(entry, &self.index, &self.config.root, &self.config.config_protect)
    }

    fn uninstall_keeping(&self, entry: &IndexEntry, still_owned: &HashSet<PathBuf>) -> Result<UnmergeReport> {
        unmerger::unmerge_keeping(
            entry,
            &self.index,
            &self.config.root,
            &self.config.config_protect,
            still_owned,
        )
    }
}
