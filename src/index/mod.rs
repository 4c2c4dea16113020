// src/index/mod.rs

//! Content Index: the on-disk record of installed packages
//!
//! The persistent state is a directory of symlinks:
//!
//! ```text
//! <location>/index.conf
//! <location>/indices/categories/<cat>/<pkg> -> ../../../data/<cat>---<pkg>
//! <location>/indices/packages/<pkg>/<cat>   -> ../../../data/<cat>---<pkg>
//! <location>/data/<cat>---<pkg>/<version>:<slot>:<magic>/contents
//! ```
//!
//! On top of that sits a lazily populated cache. The category table has a
//! single lock; each category and each package has its own. Locks are taken
//! hand over hand: the outer lock is held only long enough to find (or
//! create) the inner slot and lock it.

mod arena;
mod entry;

pub use entry::{IndexEntry, InstalledPackage};

use crate::config::{IndexConfig, INDEX_CONF, INDEX_FORMAT};
use crate::contents::{self, ContentsVisitor};
use crate::error::{Error, IoContext, Result};
use crate::name::{CategoryName, PackageName, QualifiedName};
use arena::{lock, Arena, Slot};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Version entries of one package, ascending by version
pub type Entries = Arc<Vec<Arc<IndexEntry>>>;

#[derive(Debug, Default)]
struct CategoryTable {
    /// The full listing of `indices/categories` has been read
    loaded: bool,
    categories: Arena<CategoryCache>,
    /// Memoized negative stats
    absent: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct CategoryCache {
    loaded: bool,
    packages: Arena<PackageCache>,
    absent: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct PackageCache {
    entries: Option<Entries>,
}

#[derive(Debug, Default)]
struct ReverseCache {
    categories: Option<Vec<CategoryName>>,
}

/// Lazily cached view of an index directory, safe to share between threads
#[derive(Debug)]
pub struct ContentIndex {
    location: PathBuf,
    config: IndexConfig,
    categories: Mutex<CategoryTable>,
    reverse: Mutex<Arena<ReverseCache>>,
    /// Held while index links and their directories are created or removed
    links: Mutex<()>,
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('-')
}

/// Non-hidden subdirectories of `dir` (symlinks followed), sorted; a
/// missing directory is empty
fn list_names(dir: &Path) -> Result<Vec<String>> {
    let iter = match fs::read_dir(dir) {
        Ok(iter) => iter,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_at(dir, e)),
    };

    let mut names = Vec::new();
    for entry in iter {
        let entry = entry.at(dir)?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warn!(
                    tag = "index.ids.skipping",
                    "Skipping non-UTF-8 entry {:?} in {}",
                    raw,
                    dir.display()
                );
                continue;
            }
        };
        if is_hidden(&name) {
            continue;
        }
        if !is_dir(&entry.path()) {
            debug!("Ignoring non-directory {}", entry.path().display());
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

fn is_dir(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}

/// Remove `dir` if it has no entries at all; true once it is gone
fn remove_if_empty(dir: &Path) -> Result<bool> {
    match fs::remove_dir(dir) {
        Ok(()) => {
            debug!("Removed empty index directory {}", dir.display());
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => Ok(false),
        Err(e) => Err(Error::io_at(dir, e)),
    }
}

fn remove_link(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Index link {} already gone", path.display());
            Ok(())
        }
        Err(e) => Err(Error::io_at(path, e)),
    }
}

impl ContentIndex {
    /// Open the index at `location`, creating it if the directory is empty
    ///
    /// `check_format` decides whether an existing index's
    /// `repository_format` is acceptable; `preferred_format` is written
    /// into a newly created one.
    pub fn open(
        location: impl Into<PathBuf>,
        check_format: impl Fn(&str) -> bool,
        preferred_format: &str,
    ) -> Result<Self> {
        let location = location.into();
        let conf_path = location.join(INDEX_CONF);

        let config = if conf_path.exists() {
            let config = IndexConfig::load(&conf_path)?;
            if config.format != INDEX_FORMAT {
                return Err(Error::Config(format!(
                    "{} has unsupported format '{}'",
                    conf_path.display(),
                    config.format
                )));
            }
            if !check_format(&config.repository_format) {
                return Err(Error::Config(format!(
                    "{} has unsupported repository format '{}'",
                    conf_path.display(),
                    config.repository_format
                )));
            }
            config
        } else {
            let empty = match fs::read_dir(&location) {
                Ok(mut iter) => iter.next().is_none(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => true,
                Err(e) => return Err(Error::io_at(&location, e)),
            };
            if !empty {
                return Err(Error::Config(format!(
                    "{} is not empty and has no {}",
                    location.display(),
                    INDEX_CONF
                )));
            }

            info!("Creating new index at {}", location.display());
            for dir in ["indices/categories", "indices/packages", "data"] {
                let path = location.join(dir);
                fs::create_dir_all(&path).at(&path)?;
            }
            let config = IndexConfig::new(preferred_format);
            config.save(&conf_path)?;
            config
        };

        Ok(Self {
            location,
            config,
            categories: Mutex::new(CategoryTable::default()),
            reverse: Mutex::new(Arena::default()),
            links: Mutex::new(()),
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn repository_format(&self) -> &str {
        &self.config.repository_format
    }

    fn categories_dir(&self) -> PathBuf {
        self.location.join("indices").join("categories")
    }

    fn packages_dir(&self) -> PathBuf {
        self.location.join("indices").join("packages")
    }

    fn category_link(&self, q: &QualifiedName) -> PathBuf {
        self.categories_dir().join(q.category.as_str()).join(q.package.as_str())
    }

    fn package_link(&self, q: &QualifiedName) -> PathBuf {
        self.packages_dir().join(q.package.as_str()).join(q.category.as_str())
    }

    /// The package's directory under `data/`
    ///
    /// Follows the existing index link if there is one, so a package that
    /// was indexed under a different directory name keeps using it.
    pub fn data_dir(&self, q: &QualifiedName) -> PathBuf {
        let data = self.location.join("data");
        match fs::read_link(self.category_link(q)) {
            Ok(target) => match target.file_name() {
                Some(name) => data.join(name),
                None => data.join(q.data_dir_name()),
            },
            Err(_) => data.join(q.data_dir_name()),
        }
    }

    /// All categories that have at least one indexed package
    pub fn category_names(&self) -> Result<Vec<CategoryName>> {
        // The scan runs under the table lock: `loaded` and the arena are
        // only ever updated together.
        let mut table = lock(&self.categories);
        if !table.loaded {
            let dir = self.categories_dir();
            for name in list_names(&dir)? {
                if let Err(e) = name.parse::<CategoryName>() {
                    warn!(tag = "index.ids.skipping", "Skipping entry in {}: {}", dir.display(), e);
                    continue;
                }
                if list_names(&dir.join(&name))?.is_empty() {
                    debug!("Category {} has no packages, ignoring", name);
                    continue;
                }
                table.categories.get_or_insert(&name);
                table.absent.remove(&name);
            }
            table.loaded = true;
        }

        Ok(table
            .categories
            .names()
            .filter_map(|n| n.parse().ok())
            .collect())
    }

    pub fn has_category_named(&self, category: &CategoryName) -> Result<bool> {
        Ok(self.category_slot(category)?.is_some())
    }

    /// The cache slot of an existing category
    ///
    /// Existence is decided and the slot fetched under one table guard. A
    /// slot removed afterwards by `deindex` or `reset` is detached and only
    /// ever answers "absent" or what is on disk.
    fn category_slot(&self, category: &CategoryName) -> Result<Option<Slot<CategoryCache>>> {
        let mut table = lock(&self.categories);
        let name = category.as_str();
        if let Some(slot) = table.categories.get(name) {
            return Ok(Some(slot));
        }
        if table.loaded || table.absent.contains(name) {
            return Ok(None);
        }

        // Memoized stat, under the table lock like the full scan
        if list_names(&self.categories_dir().join(name))?.is_empty() {
            table.absent.insert(name.to_string());
            Ok(None)
        } else {
            Ok(Some(table.categories.get_or_insert(name)))
        }
    }

    pub fn package_names(&self, category: &CategoryName) -> Result<Vec<QualifiedName>> {
        let Some(slot) = self.category_slot(category)? else {
            return Ok(Vec::new());
        };

        let mut cache = lock(&slot);
        if !cache.loaded {
            let dir = self.categories_dir().join(category.as_str());
            for name in list_names(&dir)? {
                if let Err(e) = name.parse::<PackageName>() {
                    warn!(tag = "index.ids.skipping", "Skipping entry in {}: {}", dir.display(), e);
                    continue;
                }
                cache.packages.get_or_insert(&name);
                cache.absent.remove(&name);
            }
            cache.loaded = true;
        }

        Ok(cache
            .packages
            .names()
            .filter_map(|n| n.parse().ok())
            .map(|package| QualifiedName::new(category.clone(), package))
            .collect())
    }

    pub fn has_package_named(&self, q: &QualifiedName) -> Result<bool> {
        Ok(self.package_slot(q)?.is_some())
    }

    /// The cache slot of an existing package, found the same way as
    /// [`Self::category_slot`]
    fn package_slot(&self, q: &QualifiedName) -> Result<Option<Slot<PackageCache>>> {
        let Some(category) = self.category_slot(&q.category)? else {
            return Ok(None);
        };

        let mut cache = lock(&category);
        let name = q.package.as_str();
        if let Some(slot) = cache.packages.get(name) {
            return Ok(Some(slot));
        }
        if cache.loaded || cache.absent.contains(name) {
            return Ok(None);
        }

        if is_dir(&self.category_link(q)) {
            Ok(Some(cache.packages.get_or_insert(name)))
        } else {
            cache.absent.insert(name.to_string());
            Ok(None)
        }
    }

    /// Installed versions of a package, ascending
    pub fn entries(&self, q: &QualifiedName) -> Result<Entries> {
        let Some(slot) = self.package_slot(q)? else {
            return Ok(Arc::new(Vec::new()));
        };

        let mut cache = lock(&slot);
        if let Some(entries) = &cache.entries {
            return Ok(Arc::clone(entries));
        }

        let link = self.category_link(q);
        let data_dir = self.data_dir(q);
        let mut entries = Vec::new();
        for name in list_names(&link)? {
            match IndexEntry::from_dir_name(q.clone(), &data_dir.join(&name)) {
                Ok(entry) => entries.push(Arc::new(entry)),
                Err(e) => warn!(
                    tag = "index.ids.skipping",
                    "Not using '{}' in {}: {}",
                    name,
                    link.display(),
                    e
                ),
            }
        }
        entries.sort_by(|a, b| a.version.cmp(&b.version));

        debug!("Loaded {} entries for {}", entries.len(), q);
        let entries = Arc::new(entries);
        cache.entries = Some(Arc::clone(&entries));
        Ok(entries)
    }

    /// Run `f` on the package cache if it already exists; never touches disk
    fn with_loaded_package(&self, q: &QualifiedName, f: impl FnOnce(&mut PackageCache)) {
        let table = lock(&self.categories);
        let Some(category) = table.categories.get(q.category.as_str()) else {
            return;
        };
        let cache = lock(&category);
        drop(table);

        let Some(package) = cache.packages.get(q.package.as_str()) else {
            return;
        };
        let mut package = lock(&package);
        drop(cache);

        f(&mut package);
    }

    /// Record a newly created version directory in the cache
    ///
    /// Does nothing if the package's entries have not been loaded yet; the
    /// next load will pick the directory up from disk.
    pub fn add_entry(&self, q: &QualifiedName, dir: &Path) -> Result<()> {
        let entry = Arc::new(IndexEntry::from_dir_name(q.clone(), dir)?);
        self.with_loaded_package(q, |cache| {
            if let Some(entries) = &cache.entries {
                let mut updated: Vec<_> = entries.iter().cloned().collect();
                let pos = updated.partition_point(|e| e.version <= entry.version);
                updated.insert(pos, entry);
                cache.entries = Some(Arc::new(updated));
            }
        });
        Ok(())
    }

    /// Drop any cached entry whose version directory is `dir`
    pub fn remove_entry(&self, q: &QualifiedName, dir: &Path) {
        self.with_loaded_package(q, |cache| {
            if let Some(entries) = &cache.entries {
                let kept: Vec<_> = entries.iter().filter(|e| e.fs_location != dir).cloned().collect();
                cache.entries = Some(Arc::new(kept));
            }
        });
    }

    /// Create both index symlinks for a package's data directory
    pub fn index(&self, q: &QualifiedName, data_dir_name: &str) -> Result<()> {
        let target = Path::new("../../../data").join(data_dir_name);
        let _links = lock(&self.links);

        for link in [self.category_link(q), self.package_link(q)] {
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent).at(parent)?;
            }
            if fs::symlink_metadata(&link).is_err() {
                debug!("Linking {} -> {}", link.display(), target.display());
                symlink(&target, &link).at(&link)?;
            }
        }

        {
            let mut table = lock(&self.categories);
            table.absent.remove(q.category.as_str());
            let category = table.categories.get_or_insert(q.category.as_str());
            let mut cache = lock(&category);
            drop(table);

            cache.absent.remove(q.package.as_str());
            cache.packages.get_or_insert(q.package.as_str());
        }

        self.forget_reverse(&q.package);
        Ok(())
    }

    /// Remove both index symlinks for a package
    ///
    /// A category or package directory left without links is removed, and
    /// a category without packages disappears from the cache.
    pub fn deindex(&self, q: &QualifiedName) -> Result<()> {
        let _links = lock(&self.links);
        remove_link(&self.category_link(q))?;
        remove_link(&self.package_link(q))?;

        let category_dir = self.categories_dir().join(q.category.as_str());
        let category_gone = list_names(&category_dir)?.is_empty();
        if category_gone {
            remove_if_empty(&category_dir)?;
        }
        let package_dir = self.packages_dir().join(q.package.as_str());
        if list_names(&package_dir)?.is_empty() {
            remove_if_empty(&package_dir)?;
        }

        {
            let mut table = lock(&self.categories);
            if let Some(category) = table.categories.get(q.category.as_str()) {
                let mut cache = lock(&category);
                cache.packages.remove(q.package.as_str());
                if !cache.loaded {
                    cache.absent.insert(q.package.to_string());
                }
            }

            if category_gone {
                debug!("Category {} is now empty", q.category);
                table.categories.remove(q.category.as_str());
                if !table.loaded {
                    table.absent.insert(q.category.to_string());
                }
            }
        }

        self.forget_reverse(&q.package);
        Ok(())
    }

    fn forget_reverse(&self, package: &PackageName) {
        let reverse = lock(&self.reverse);
        if let Some(slot) = reverse.get(package.as_str()) {
            let mut cache = lock(&slot);
            drop(reverse);
            cache.categories = None;
        }
    }

    /// Categories in which a package of this name is indexed
    pub fn category_names_containing_package(&self, package: &PackageName) -> Result<Vec<CategoryName>> {
        let mut reverse = lock(&self.reverse);
        let slot = reverse.get_or_insert(package.as_str());
        let mut cache = lock(&slot);
        drop(reverse);

        if let Some(categories) = &cache.categories {
            return Ok(categories.clone());
        }

        let dir = self.packages_dir().join(package.as_str());
        let mut categories = Vec::new();
        for name in list_names(&dir)? {
            match name.parse::<CategoryName>() {
                Ok(category) => categories.push(category),
                Err(e) => warn!(tag = "index.ids.skipping", "Skipping entry in {}: {}", dir.display(), e),
            }
        }

        cache.categories = Some(categories.clone());
        Ok(categories)
    }

    /// Stream the Contents Store of an installed entry
    pub fn parse_contents(&self, entry: &IndexEntry, visitor: &mut dyn ContentsVisitor) -> Result<()> {
        contents::parse_contents(&entry.contents_path(), visitor)
    }

    /// Forget everything cached; the next query goes back to disk
    pub fn reset(&self) {
        debug!("Resetting index caches for {}", self.location.display());
        *lock(&self.categories) = CategoryTable::default();
        *lock(&self.reverse) = Arena::default();
    }

    /// Check that a package is reachable through both index symlinks or
    /// through neither, and that they agree on the data directory
    pub fn verify(&self, q: &QualifiedName) -> Result<()> {
        let by_category = fs::read_link(self.category_link(q)).ok();
        let by_package = fs::read_link(self.package_link(q)).ok();

        match (by_category, by_package) {
            (None, None) => Ok(()),
            (Some(a), Some(b)) if a == b => Ok(()),
            (Some(a), Some(b)) => Err(Error::Internal(format!(
                "index links for {} disagree: {} vs {}",
                q,
                a.display(),
                b.display()
            ))),
            (Some(_), None) => Err(Error::Internal(format!(
                "{} is indexed by category but not by package",
                q
            ))),
            (None, Some(_)) => Err(Error::Internal(format!(
                "{} is indexed by package but not by category",
                q
            ))),
        }
    }

    /// Every installed entry, gathered across categories in parallel
    pub fn all_entries(&self) -> Result<Vec<Arc<IndexEntry>>> {
        let categories = self.category_names()?;
        let per_category = categories
            .par_iter()
            .map(|category| -> Result<Vec<Arc<IndexEntry>>> {
                let mut found = Vec::new();
                for q in self.package_names(category)? {
                    found.extend(self.entries(&q)?.iter().cloned());
                }
                Ok(found)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(per_category.into_iter().flatten().collect())
    }
}
