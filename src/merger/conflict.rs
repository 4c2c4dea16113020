// src/merger/conflict.rs

use std::fmt;
use std::path::{Path, PathBuf};

/// What is at a path, without following a final symlink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    Nothing,
    File,
    Dir,
    Symlink,
    /// Fifos, sockets, device nodes
    Other,
}

impl EntryType {
    pub fn of(path: &Path) -> Self {
        match std::fs::symlink_metadata(path) {
            Err(_) => EntryType::Nothing,
            Ok(meta) => {
                let ft = meta.file_type();
                if ft.is_symlink() {
                    EntryType::Symlink
                } else if ft.is_file() {
                    EntryType::File
                } else if ft.is_dir() {
                    EntryType::Dir
                } else {
                    EntryType::Other
                }
            }
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::Nothing => "nothing",
            EntryType::File => "file",
            EntryType::Dir => "directory",
            EntryType::Symlink => "symlink",
            EntryType::Other => "special file",
        };
        f.write_str(s)
    }
}

/// A single structural mismatch between image and root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Root-relative path, with a leading `/`
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// Every conflict found by a check, or the one that stopped a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    conflicts: Vec<Conflict>,
}

impl ConflictReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn push(&mut self, conflict: Conflict) {
        self.conflicts.push(conflict);
    }

    /// True if any conflict was reported for `path`
    pub fn mentions(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        self.conflicts.iter().any(|c| c.path == path)
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.conflicts.as_slice() {
            [] => f.write_str("no conflicts"),
            [only] => write!(f, "{}", only),
            [first, rest @ ..] => write!(f, "{} (and {} more)", first, rest.len()),
        }
    }
}
