// src/lib.rs

//! installdb: package installation and index engine
//!
//! Applies a built image onto a live filesystem root, records what was
//! installed, and reverses it again on removal.
//!
//! # Architecture
//!
//! - Content Index: a symlink directory of installed packages with a lazily
//!   populated, lock-protected cache shared between threads
//! - Contents Store: one line per installed entry, per installed version
//! - Merge Engine: check mode collects conflicts, merge mode installs
//! - Unmerge Engine: removes only what still matches its record
//! - Installed Repository: check, merge, index and replace in one call

pub mod config;
pub mod contents;
mod error;
pub mod index;
pub mod merger;
pub mod name;
pub mod repository;
pub mod unmerger;
pub mod version;

pub use config::{ConfigProtect, EngineConfig};
pub use error::{Error, Result};
pub use index::{ContentIndex, IndexEntry};
pub use merger::{check, merge, ConflictReport, MergeOptions, MergeParams, MergeTarget};
pub use name::{CategoryName, PackageName, QualifiedName, SlotName};
pub use repository::{InstallRequest, InstalledRepository};
pub use unmerger::{unmerge, UnmergeReport};
pub use version::VersionSpec;
