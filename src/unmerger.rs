// src/unmerger.rs

//! Unmerge Engine: removes what a Contents Store says was installed
//!
//! Entries are processed deepest path first, so a directory is only
//! considered once everything recorded beneath it has been handled. Anything
//! that no longer matches its record is left in place and reported.

use crate::config::ConfigProtect;
use crate::contents::ContentsEntry;
use crate::error::{IoContext, Result};
use crate::index::{ContentIndex, IndexEntry};
use crate::merger::{install, md5_file, EntryType};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Why an entry was left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepReason {
    /// The live entry is of a different type than recorded
    WrongType(EntryType),
    MtimeChanged,
    Md5Changed,
    /// The file could not be read to compute its md5
    Unreadable,
    TargetChanged,
    NotEmpty,
    ConfigProtected,
    /// Installed again by the package replacing this one
    StillOwned,
    /// Fifos and device nodes are never removed
    Misc,
}

impl fmt::Display for KeepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeepReason::WrongType(found) => write!(f, "!type (found {})", found),
            KeepReason::MtimeChanged => f.write_str("!time"),
            KeepReason::Md5Changed => f.write_str("!md5"),
            KeepReason::Unreadable => f.write_str("!md5?"),
            KeepReason::TargetChanged => f.write_str("!dest"),
            KeepReason::NotEmpty => f.write_str("!empt"),
            KeepReason::ConfigProtected => f.write_str("cfgpr"),
            KeepReason::StillOwned => f.write_str("owned"),
            KeepReason::Misc => f.write_str("misc"),
        }
    }
}

/// An entry that was left in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kept {
    /// Root-relative path, with a leading `/`
    pub path: PathBuf,
    pub reason: KeepReason,
}

/// What an unmerge did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmergeReport {
    pub removed: Vec<PathBuf>,
    pub kept: Vec<Kept>,
}

impl UnmergeReport {
    pub fn was_kept(&self, path: impl AsRef<Path>) -> Option<&KeepReason> {
        let path = path.as_ref();
        self.kept.iter().find(|k| k.path == path).map(|k| &k.reason)
    }
}

/// Removes recorded entries from a root
pub struct Unmerger<'a> {
    root: &'a Path,
    config_protect: &'a ConfigProtect,
    still_owned: Option<&'a HashSet<PathBuf>>,
}

impl<'a> Unmerger<'a> {
    pub fn new(root: &'a Path, config_protect: &'a ConfigProtect) -> Self {
        Self {
            root,
            config_protect,
            still_owned: None,
        }
    }

    /// Leave these root-relative paths alone; another package now owns them
    pub fn with_still_owned(mut self, paths: &'a HashSet<PathBuf>) -> Self {
        self.still_owned = Some(paths);
        self
    }

    fn live_path(&self, tidy: &Path) -> PathBuf {
        self.root.join(tidy.strip_prefix("/").unwrap_or(tidy))
    }

    /// Remove every entry that still matches its record
    pub fn unmerge(&self, mut entries: Vec<ContentsEntry>) -> Result<UnmergeReport> {
        entries.sort_by(|a, b| b.path().cmp(a.path()));

        let mut report = UnmergeReport::default();
        for entry in &entries {
            let tidy = entry.path();
            match self.check(entry)? {
                Some(reason) => {
                    info!("--- [{}] {}", reason, tidy.display());
                    report.kept.push(Kept {
                        path: tidy.to_path_buf(),
                        reason,
                    });
                }
                None => {
                    let live = self.live_path(tidy);
                    info!("<<< {}", tidy.display());
                    match entry {
                        ContentsEntry::Dir(_) => fs::remove_dir(&live).at(&live)?,
                        _ => install::unlink(&live)?,
                    }
                    report.removed.push(tidy.to_path_buf());
                }
            }
        }

        debug!(
            "Unmerge removed {} entries, kept {}",
            report.removed.len(),
            report.kept.len()
        );
        Ok(report)
    }

    /// `None` if the entry may be removed
    fn check(&self, entry: &ContentsEntry) -> Result<Option<KeepReason>> {
        if self.still_owned.is_some_and(|owned| owned.contains(entry.path())) {
            return Ok(Some(KeepReason::StillOwned));
        }

        let live = self.live_path(entry.path());
        let found = EntryType::of(&live);

        let reason = match entry {
            ContentsEntry::Misc(_) => Some(KeepReason::Misc),
            ContentsEntry::File(file) => {
                if found != EntryType::File {
                    Some(KeepReason::WrongType(found))
                } else if fs::symlink_metadata(&live).at(&live)?.mtime() != file.mtime {
                    Some(KeepReason::MtimeChanged)
                } else {
                    match md5_file(&live) {
                        Err(e) => {
                            warn!(tag = "unmerger.md5", "Cannot get md5 for '{}': {}", live.display(), e);
                            Some(KeepReason::Unreadable)
                        }
                        Ok(md5) if md5 != file.md5 => Some(KeepReason::Md5Changed),
                        Ok(_) if self.config_protect.is_protected(&file.path.to_string_lossy()) => {
                            Some(KeepReason::ConfigProtected)
                        }
                        Ok(_) => None,
                    }
                }
            }
            ContentsEntry::Sym(sym) => {
                if found != EntryType::Symlink {
                    Some(KeepReason::WrongType(found))
                } else if fs::symlink_metadata(&live).at(&live)?.mtime() != sym.mtime {
                    Some(KeepReason::MtimeChanged)
                } else if fs::read_link(&live).at(&live)? != sym.target {
                    Some(KeepReason::TargetChanged)
                } else {
                    None
                }
            }
            ContentsEntry::Dir(_) => {
                if found != EntryType::Dir {
                    Some(KeepReason::WrongType(found))
                } else if fs::read_dir(&live).at(&live)?.next().is_some() {
                    Some(KeepReason::NotEmpty)
                } else {
                    None
                }
            }
        };

        Ok(reason)
    }
}

/// Remove an installed entry from `root` and from the index
///
/// After the files are handled the version directory is deleted. If it was
/// the package's last version, the package directory goes too and the
/// package is deindexed.
pub fn unmerge(
    entry: &IndexEntry,
    index: &ContentIndex,
    root: &Path,
    config_protect: &ConfigProtect,
) -> Result<UnmergeReport> {
    unmerge_keeping(entry, index, root, config_protect, &HashSet::new())
}

/// [`unmerge`], leaving `still_owned` root-relative paths in place
pub(crate) fn unmerge_keeping(
    entry: &IndexEntry,
    index: &ContentIndex,
    root: &Path,
    config_protect: &ConfigProtect,
    still_owned: &HashSet<PathBuf>,
) -> Result<UnmergeReport> {
    info!("Unmerging {}-{}:{} from {}", entry.name, entry.version, entry.slot, root.display());

    let mut entries: Vec<ContentsEntry> = Vec::new();
    index.parse_contents(entry, &mut entries)?;
    let report = Unmerger::new(root, config_protect)
        .with_still_owned(still_owned)
        .unmerge(entries)?;

    forget_entry(entry, index)?;
    Ok(report)
}

/// Delete the version directory and drop the entry from the index
fn forget_entry(entry: &IndexEntry, index: &ContentIndex) -> Result<()> {
    fs::remove_dir_all(&entry.fs_location).at(&entry.fs_location)?;
    index.remove_entry(&entry.name, &entry.fs_location);

    if let Some(package_dir) = entry.fs_location.parent() {
        let empty = fs::read_dir(package_dir).at(package_dir)?.next().is_none();
        if empty {
            debug!("Removing empty package directory {}", package_dir.display());
            fs::remove_dir(package_dir).at(package_dir)?;
            index.deindex(&entry.name)?;
        }
    }
    Ok(())
}
