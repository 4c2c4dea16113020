// src/merger/hooks.rs

//! Extension points for the merge walk

use std::path::Path;
use tracing::{error, info, warn};

/// Notified as the walk moves through the image
///
/// All methods default to doing nothing.
pub trait MergeObserver {
    fn on_enter_dir(&self, _is_check: bool, _image_dir: &Path) {}
    fn on_leave_dir(&self, _is_check: bool, _image_dir: &Path) {}
    /// Called once the whole image has been walked
    fn on_done(&self, _is_check: bool) {}
}

/// Receives the merge's user-facing messages
pub trait MergeReporter {
    /// A non-fatal problem
    fn warn(&self, is_check: bool, message: &str);

    /// A conflict; in merge mode it is about to become an error
    fn error(&self, is_check: bool, message: &str);

    /// One line per merged entry, e.g. `>>> [obj] /usr/bin/foo`
    fn display(&self, line: &str);
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl MergeObserver for NoopObserver {}

/// Reporter that forwards everything to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl MergeReporter for LogReporter {
    fn warn(&self, is_check: bool, message: &str) {
        warn!(tag = "merger.warning", check = is_check, "{}", message);
    }

    fn error(&self, is_check: bool, message: &str) {
        if is_check {
            warn!(tag = "merger.conflict", "{}", message);
        } else {
            error!(tag = "merger.conflict", "{}", message);
        }
    }

    fn display(&self, line: &str) {
        info!("{}", line);
    }
}
