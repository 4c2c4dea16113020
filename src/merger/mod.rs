// src/merger/mod.rs

//! Merge Engine: applies an image directory onto a live root
//!
//! One walk serves two modes. In check mode nothing is modified and every
//! conflict is collected into a [`ConflictReport`]. In merge mode entries
//! are installed as they are visited, each one is recorded in a Contents
//! Store, and the first conflict aborts the merge.
//!
//! | image \ root | nothing  | file      | dir      | symlink       | other   |
//! |--------------|----------|-----------|----------|---------------|---------|
//! | file         | install  | replace*  | conflict | replace       | replace |
//! | dir          | create   | conflict  | recurse  | recurse if it resolves to a dir | replace |
//! | symlink      | install  | replace   | conflict | replace       | replace |
//! | other        | conflict | conflict  | conflict | conflict      | conflict |
//!
//! `*` subject to configuration protection.

mod conflict;
mod hooks;
pub(crate) mod install;
mod walk;

pub use conflict::{Conflict, ConflictReport, EntryType};
pub use hooks::{LogReporter, MergeObserver, MergeReporter, NoopObserver};
pub use install::md5_file;

use crate::config::ConfigProtect;
use crate::contents::{ContentsWriter, CONTENTS_FILE};
use crate::error::{Error, IoContext, Result};
use crate::index::{ContentIndex, IndexEntry};
use crate::name::QualifiedName;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;
use walk::Walk;

/// Independent switches for a merge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeOptions {
    /// Rewrite absolute symlinks pointing into the image instead of failing
    pub rewrite_symlinks: bool,
    /// Install empty directories instead of treating them as conflicts
    pub allow_empty_dirs: bool,
    /// Keep image mtimes verbatim
    pub preserve_mtimes: bool,
    /// Never change ownership
    pub no_chown: bool,
    /// Copy instead of moving, leaving the image intact
    pub nondestructive: bool,
}

/// Requested owner for an installed entry; `None` keeps the image's
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Maps an image path to the ownership it should be installed with
pub type OwnershipFn = dyn Fn(&Path) -> Ownership + Send + Sync;

/// Named partitions of the root, some of which may be switched off
///
/// A path belongs to the partition with the longest matching prefix.
#[derive(Debug, Clone, Default)]
pub struct Partitioning {
    prefixes: Vec<(PathBuf, String)>,
    disabled: Vec<String>,
}

impl Partitioning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign root-relative `paths` (and everything below them) to `partition`
    pub fn mark<I, P>(&mut self, paths: I, partition: &str)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.prefixes.push((path.into(), partition.to_string()));
        }
    }

    pub fn disable(&mut self, partition: &str) {
        self.disabled.push(partition.to_string());
    }

    /// The partition `path` falls into, if any
    pub fn classify(&self, path: &Path) -> Option<&str> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.components().count())
            .map(|(_, name)| name.as_str())
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.classify(path)
            .is_some_and(|name| self.disabled.iter().any(|d| d == name))
    }
}

/// Everything a merge needs besides the image and root
#[derive(Default)]
pub struct MergeParams {
    pub options: MergeOptions,
    /// Files older than this get the current time; `None` means all files do
    pub fix_mtimes_before: Option<SystemTime>,
    pub config_protect: ConfigProtect,
    pub ownership: Option<Box<OwnershipFn>>,
    pub partitioning: Option<Partitioning>,
    pub observer: Option<Box<dyn MergeObserver + Send + Sync>>,
    pub reporter: Option<Box<dyn MergeReporter + Send + Sync>>,
}

impl MergeParams {
    pub fn new(options: MergeOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn with_config_protect(mut self, config_protect: ConfigProtect) -> Self {
        self.config_protect = config_protect;
        self
    }

    pub fn with_fix_mtimes_before(mut self, cutoff: SystemTime) -> Self {
        self.fix_mtimes_before = Some(cutoff);
        self
    }

    pub fn with_ownership(mut self, f: impl Fn(&Path) -> Ownership + Send + Sync + 'static) -> Self {
        self.ownership = Some(Box::new(f));
        self
    }

    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = Some(partitioning);
        self
    }

    pub fn with_observer(mut self, observer: impl MergeObserver + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_reporter(mut self, reporter: impl MergeReporter + Send + Sync + 'static) -> Self {
        self.reporter = Some(Box::new(reporter));
        self
    }

    pub(crate) fn observer(&self) -> &dyn MergeObserver {
        match &self.observer {
            Some(observer) => observer.as_ref(),
            None => &NoopObserver,
        }
    }

    pub(crate) fn reporter(&self) -> &dyn MergeReporter {
        match &self.reporter {
            Some(reporter) => reporter.as_ref(),
            None => &LogReporter,
        }
    }
}

/// Where a merged package is recorded
#[derive(Debug, Clone)]
pub struct MergeTarget {
    pub name: QualifiedName,
    /// An existing, empty `data/<dir>/<version>:<slot>:<magic>` directory
    pub version_dir: PathBuf,
}

/// An image and a root, validated and resolved
pub struct Merger<'a> {
    image: PathBuf,
    image_as_given: PathBuf,
    root: PathBuf,
    params: &'a MergeParams,
}

impl<'a> Merger<'a> {
    pub fn new(image: &Path, root: &Path, params: &'a MergeParams) -> Result<Self> {
        if !image.is_dir() {
            return Err(Error::Merge(format!("Image '{}' is not a directory", image.display())));
        }
        if !root.is_dir() {
            return Err(Error::Merge(format!("Root '{}' is not a directory", root.display())));
        }

        Ok(Self {
            image: fs::canonicalize(image).at(image)?,
            image_as_given: image.to_path_buf(),
            root: fs::canonicalize(root).at(root)?,
            params,
        })
    }

    /// Walk without modifying anything, collecting every conflict
    pub fn check(&self) -> Result<ConflictReport> {
        info!("Checking merge of {} to {}", self.image.display(), self.root.display());
        Walk::new(self, true, None).run()
    }

    /// Install the image, stopping at the first conflict
    pub fn merge(&self, contents: Option<&mut ContentsWriter>) -> Result<()> {
        info!("Merging {} to {}", self.image.display(), self.root.display());
        Walk::new(self, false, contents).run().map(|_| ())
    }
}

/// Check whether `image` can be merged onto `root`
pub fn check(image: &Path, root: &Path, params: &MergeParams) -> Result<ConflictReport> {
    Merger::new(image, root, params)?.check()
}

/// Merge `image` onto `root`, record its contents in `target.version_dir`
/// and register it with the index
///
/// Conflicts surface as [`Error::Conflict`]. There is no rollback; run
/// [`check`] first.
pub fn merge(
    image: &Path,
    root: &Path,
    params: &MergeParams,
    index: &ContentIndex,
    target: &MergeTarget,
) -> Result<IndexEntry> {
    let merger = Merger::new(image, root, params)?;

    let mut contents = ContentsWriter::create(&target.version_dir.join(CONTENTS_FILE))?;
    merger.merge(Some(&mut contents))?;
    contents.finish()?;

    let data_dir_name = target
        .version_dir
        .parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::Merge(format!(
                "'{}' is not inside a package data directory",
                target.version_dir.display()
            ))
        })?;

    index.index(&target.name, data_dir_name)?;
    index.add_entry(&target.name, &target.version_dir)?;
    IndexEntry::from_dir_name(target.name.clone(), &target.version_dir)
}
