// src/error.rs

use crate::merger::ConflictReport;
use std::path::PathBuf;
use thiserror::Error;

/// Core error types for installdb
#[derive(Error, Debug)]
pub enum Error {
    /// Bad, missing or unsupported index metadata
    #[error("Configuration error: {0}")]
    Config(String),

    /// A category, package or slot name that does not parse
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// A version string that does not parse
    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    /// Structural mismatch between image and root
    #[error("Merge conflict: {0}")]
    Conflict(ConflictReport),

    /// Merge failures that are not image/root conflicts
    #[error("Merge error: {0}")]
    Merge(String),

    /// Cache and on-disk index disagree; always a bug
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O errors with the path that caused them
    #[error("I/O error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Engine configuration files
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an I/O error with the path it happened on
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::IoAt {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias using installdb's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Attach a path to `std::io::Result` failures
pub(crate) trait IoContext<T> {
    fn at(self, path: &std::path::Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| Error::io_at(path, e))
    }
}
