// src/merger/install.rs

//! Filesystem primitives used by the merge walk and the unmerger

use crate::error::{IoContext, Result};
use md5::{Digest, Md5};
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, Metadata, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

/// `S_ISUID | S_ISGID`
pub(crate) const SETID_BITS: u32 = 0o6000;

/// All permission bits, including set-id and sticky
pub(crate) const MODE_BITS: u32 = 0o7777;

/// Hex md5 of a file's contents
pub fn md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).at(path)?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher).at(path)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Pick the name a protected file is installed under
///
/// The plain basename is used if it is free or already has identical
/// contents; otherwise the first free (or identical) `._cfgNNNN_<name>`.
pub(crate) fn config_protect_name(src: &Path, dst_dir: &Path, basename: &OsStr) -> Result<OsString> {
    let ours = md5_file(src)?;
    let mut name = basename.to_os_string();
    let mut counter = 0u32;

    loop {
        let candidate = dst_dir.join(&name);
        if fs::symlink_metadata(&candidate).is_err() {
            break;
        }
        let regular = fs::metadata(&candidate).map(|m| m.is_file()).unwrap_or(false);
        if regular && md5_file(&candidate).ok().as_deref() == Some(ours.as_str()) {
            break;
        }

        name = OsString::from(format!("._cfg{:04}_", counter));
        name.push(basename);
        counter += 1;
    }

    Ok(name)
}

/// Reduce a set-id regular file to owner-read-only; other files are untouched
pub(crate) fn neuter_setid(path: &Path, meta: &Metadata) -> Result<()> {
    let mode = meta.permissions().mode();
    if meta.is_file() && mode & SETID_BITS != 0 {
        debug!("Clearing set-id bits on {} before removal", path.display());
        fs::set_permissions(path, Permissions::from_mode(mode & 0o400)).at(path)?;
    }
    Ok(())
}

/// Remove a file or symlink, clearing set-id bits first
pub(crate) fn unlink(path: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(path) {
        neuter_setid(path, &meta)?;
    }
    fs::remove_file(path).at(path)
}

/// Change ownership where it differs from `current`; returns whether it did
pub(crate) fn apply_ownership(
    path: &Path,
    current: &Metadata,
    uid: Option<u32>,
    gid: Option<u32>,
    follow_symlinks: bool,
) -> Result<bool> {
    let uid = uid.filter(|u| *u != current.uid());
    let gid = gid.filter(|g| *g != current.gid());
    if uid.is_none() && gid.is_none() {
        return Ok(false);
    }

    debug!("Changing ownership of {} to {:?}:{:?}", path.display(), uid, gid);
    if follow_symlinks {
        std::os::unix::fs::chown(path, uid, gid).at(path)?;
    } else {
        std::os::unix::fs::lchown(path, uid, gid).at(path)?;
    }
    Ok(true)
}

/// Temporary name used while a copy is in flight
pub(crate) fn midmerge_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().map(OsString::from).unwrap_or_default();
    name.push("|midmerge");
    dst.with_file_name(name)
}

/// Copy `src` to `dst` through a temporary name, then rename into place
pub(crate) fn copy_into_place(src: &Path, dst: &Path, mode: u32) -> Result<()> {
    let mid = midmerge_path(dst);
    {
        let mut input = File::open(src).at(src)?;
        let mut output = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode & 0o777)
            .open(&mid)
            .at(&mid)?;
        io::copy(&mut input, &mut output).at(&mid)?;
        output.set_permissions(Permissions::from_mode(mode & MODE_BITS)).at(&mid)?;
    }
    fs::rename(&mid, dst).at(dst)
}

/// Hard link `existing` at `dst` through a temporary name
pub(crate) fn link_into_place(existing: &Path, dst: &Path) -> Result<()> {
    let mid = midmerge_path(dst);
    fs::hard_link(existing, &mid).at(&mid)?;
    fs::rename(&mid, dst).at(dst)
}
