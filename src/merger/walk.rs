// src/merger/walk.rs

//! The image walk shared by check and merge

use super::install::{
    apply_ownership, config_protect_name, copy_into_place, link_into_place, md5_file, neuter_setid, unlink,
    MODE_BITS, SETID_BITS,
};
use super::{Conflict, ConflictReport, EntryType, MergeParams, Merger};
use crate::contents::{ContentsDir, ContentsEntry, ContentsFile, ContentsSym, ContentsWriter};
use crate::error::{Error, IoContext, Result};
use filetime::FileTime;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, Metadata, Permissions};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::debug;

pub(super) struct Walk<'a> {
    merger: &'a Merger<'a>,
    params: &'a MergeParams,
    is_check: bool,
    report: ConflictReport,
    contents: Option<&'a mut ContentsWriter>,
    /// Installed path of every image inode already merged, keyed by (dev, ino)
    merged_ids: HashMap<(u64, u64), PathBuf>,
    now: FileTime,
}

impl<'a> Walk<'a> {
    pub fn new(merger: &'a Merger<'a>, is_check: bool, contents: Option<&'a mut ContentsWriter>) -> Self {
        Self {
            merger,
            params: merger.params,
            is_check,
            report: ConflictReport::default(),
            contents,
            merged_ids: HashMap::new(),
            now: FileTime::now(),
        }
    }

    pub fn run(mut self) -> Result<ConflictReport> {
        let image = self.merger.image.clone();
        let root = self.merger.root.clone();
        self.walk_dir(&image, &root, Path::new("/"))?;
        self.params.observer().on_done(self.is_check);
        Ok(self.report)
    }

    fn conflict(&mut self, tidy: &Path, message: String) -> Result<()> {
        self.params.reporter().error(self.is_check, &message);
        let conflict = Conflict {
            path: tidy.to_path_buf(),
            message,
        };

        if self.is_check {
            self.report.push(conflict);
            Ok(())
        } else {
            let mut report = ConflictReport::default();
            report.push(conflict);
            Err(Error::Conflict(report))
        }
    }

    fn warn(&self, message: &str) {
        self.params.reporter().warn(self.is_check, message);
    }

    fn display(&self, line: String) {
        if !self.is_check {
            self.params.reporter().display(&line);
        }
    }

    fn record(&mut self, entry: ContentsEntry) -> Result<()> {
        match self.contents.as_mut() {
            Some(writer) => writer.write_entry(&entry),
            None => Ok(()),
        }
    }

    fn walk_dir(&mut self, src_dir: &Path, dst_dir: &Path, tidy_dir: &Path) -> Result<()> {
        self.params.observer().on_enter_dir(self.is_check, src_dir);

        let mut children = Vec::new();
        for entry in fs::read_dir(src_dir).at(src_dir)? {
            children.push(entry.at(src_dir)?.file_name());
        }
        children.sort();

        if children.is_empty() && !self.params.options.allow_empty_dirs {
            self.conflict(
                tidy_dir,
                format!("Found empty directory '{}' in the image", src_dir.display()),
            )?;
        }

        for name in &children {
            let src = src_dir.join(name);
            let dst = dst_dir.join(name);
            let tidy = tidy_dir.join(name);

            if let Some(parts) = &self.params.partitioning
                && parts.is_excluded(&tidy)
            {
                self.display(format!("--- [skp] {}", tidy.display()));
                continue;
            }

            match EntryType::of(&src) {
                EntryType::File => self.on_file(&src, &dst, &tidy)?,
                EntryType::Dir => self.on_dir(&src, &dst, &tidy)?,
                EntryType::Symlink => self.on_sym(&src, &dst, &tidy)?,
                EntryType::Other => self.conflict(
                    &tidy,
                    format!("'{}' is neither file, directory nor symlink", src.display()),
                )?,
                EntryType::Nothing => {
                    return Err(Error::Merge(format!(
                        "'{}' disappeared from the image during the walk",
                        src.display()
                    )));
                }
            }
        }

        self.params.observer().on_leave_dir(self.is_check, src_dir);
        Ok(())
    }

    /// Requested ownership with image ownership filled in, or nothing at all
    /// when ownership changes are disabled. Also reports whether the
    /// mapping moved away from the image's ownership.
    fn ownership_for(&self, src: &Path, meta: &Metadata) -> (Option<u32>, Option<u32>, bool) {
        if self.params.options.no_chown {
            return (None, None, false);
        }

        let mapped = self.params.ownership.as_ref().map(|f| f(src)).unwrap_or_default();
        let uid = mapped.uid.unwrap_or(meta.uid());
        let gid = mapped.gid.unwrap_or(meta.gid());
        let fixed = uid != meta.uid() || gid != meta.gid();
        (Some(uid), Some(gid), fixed)
    }

    fn on_file(&mut self, src: &Path, dst: &Path, tidy: &Path) -> Result<()> {
        let existing = EntryType::of(dst);
        if existing == EntryType::Dir {
            return self.conflict(
                tidy,
                format!(
                    "Cannot overwrite directory '{}' with file '{}'",
                    dst.display(),
                    src.display()
                ),
            );
        }
        if self.is_check {
            return Ok(());
        }

        let basename = file_name(src)?;
        let protected = existing == EntryType::File
            && self.params.config_protect.is_protected(&tidy.to_string_lossy());
        let name = if protected {
            config_protect_name(src, parent(dst)?, basename)?
        } else {
            basename.to_os_string()
        };

        let dst_real = parent(dst)?.join(&name);
        self.install_file(src, &dst_real)?;

        let meta = fs::metadata(&dst_real).at(&dst_real)?;
        self.record(ContentsEntry::File(ContentsFile {
            path: tidy.to_path_buf(),
            md5: md5_file(&dst_real)?,
            mtime: meta.mtime(),
        }))?;

        let arrows = if existing == EntryType::Nothing { ">>>" } else { "<<<" };
        if name == basename {
            self.display(format!("{} [obj] {}", arrows, tidy.display()));
        } else {
            self.display(format!("{} [obj] {} ({})", arrows, tidy.display(), name.to_string_lossy()));
        }
        Ok(())
    }

    fn install_file(&mut self, src: &Path, dst: &Path) -> Result<()> {
        let src_meta = fs::symlink_metadata(src).at(src)?;
        let id = (src_meta.dev(), src_meta.ino());
        let mode = src_meta.permissions().mode() & MODE_BITS;
        let first_link = !self.merged_ids.contains_key(&id);

        if let Ok(existing) = fs::symlink_metadata(dst) {
            neuter_setid(dst, &existing)?;
        }

        let renamed = !self.params.options.nondestructive
            && match fs::rename(src, dst) {
                Ok(()) => true,
                Err(e) => {
                    debug!("rename {} failed: {}, copying instead", src.display(), e);
                    false
                }
            };

        if !renamed {
            let linked = match self.merged_ids.get(&id) {
                Some(earlier) => match link_into_place(earlier, dst) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("link to {} failed: {}, copying instead", earlier.display(), e);
                        false
                    }
                },
                None => false,
            };
            if !linked {
                copy_into_place(src, dst, mode)?;
            }
        }
        self.merged_ids.entry(id).or_insert_with(|| dst.to_path_buf());

        let (uid, gid, _) = self.ownership_for(src, &src_meta);
        let current = fs::metadata(dst).at(dst)?;
        apply_ownership(dst, &current, uid, gid, true)?;
        // chown clears set-id bits on files
        fs::set_permissions(dst, Permissions::from_mode(mode)).at(dst)?;

        if first_link {
            let image_mtime = FileTime::from_last_modification_time(&src_meta);
            let mtime = if self.params.options.preserve_mtimes {
                image_mtime
            } else {
                match self.params.fix_mtimes_before.map(FileTime::from_system_time) {
                    Some(cutoff) if image_mtime >= cutoff => image_mtime,
                    _ => self.now,
                }
            };
            filetime::set_file_mtime(dst, mtime).at(dst)?;
        }

        Ok(())
    }

    fn on_dir(&mut self, src: &Path, dst: &Path, tidy: &Path) -> Result<()> {
        match EntryType::of(dst) {
            EntryType::File => self.conflict(
                tidy,
                format!(
                    "Cannot overwrite file '{}' with directory '{}'",
                    dst.display(),
                    src.display()
                ),
            ),
            EntryType::Nothing => {
                if !self.is_check {
                    self.install_dir(src, dst, tidy, ">>>")?;
                }
                self.walk_dir(src, dst, tidy)
            }
            EntryType::Dir => {
                if !self.is_check {
                    self.record_dir(tidy, "===")?;
                }
                self.walk_dir(src, dst, tidy)
            }
            EntryType::Symlink => match fs::canonicalize(dst) {
                Ok(real) if real.is_dir() => {
                    self.warn(&format!(
                        "Expected '{}' to be a directory but found a symlink to a directory",
                        dst.display()
                    ));
                    if !self.is_check {
                        self.record_dir(tidy, "===")?;
                    }
                    self.walk_dir(src, &real, tidy)
                }
                _ => self.conflict(
                    tidy,
                    format!(
                        "Expected '{}' to be a directory but found a symlink to a non-directory",
                        dst.display()
                    ),
                ),
            },
            EntryType::Other => {
                if !self.is_check {
                    unlink(dst)?;
                    self.install_dir(src, dst, tidy, "<<<")?;
                }
                self.walk_dir(src, dst, tidy)
            }
        }
    }

    fn install_dir(&mut self, src: &Path, dst: &Path, tidy: &Path, arrows: &str) -> Result<()> {
        let src_meta = fs::symlink_metadata(src).at(src)?;
        let mut mode = src_meta.permissions().mode() & MODE_BITS;

        fs::DirBuilder::new().mode(mode & 0o777).create(dst).at(dst)?;

        let (uid, gid, fixed) = self.ownership_for(src, &src_meta);
        let created = fs::metadata(dst).at(dst)?;
        apply_ownership(dst, &created, uid, gid, true)?;
        if fixed {
            mode &= !SETID_BITS;
        }
        fs::set_permissions(dst, Permissions::from_mode(mode)).at(dst)?;

        self.record_dir(tidy, arrows)
    }

    fn record_dir(&mut self, tidy: &Path, arrows: &str) -> Result<()> {
        self.display(format!("{} [dir] {}", arrows, tidy.display()));
        self.record(ContentsEntry::Dir(ContentsDir {
            path: tidy.to_path_buf(),
        }))
    }

    /// The target with the image prefix stripped, if it points into the image
    fn rewritten_target(&self, target: &Path) -> Option<PathBuf> {
        if !target.is_absolute() {
            return None;
        }
        [&self.merger.image, &self.merger.image_as_given]
            .into_iter()
            .find_map(|prefix| target.strip_prefix(prefix).ok())
            .map(|rest| Path::new("/").join(rest))
    }

    fn on_sym(&mut self, src: &Path, dst: &Path, tidy: &Path) -> Result<()> {
        let mut target = fs::read_link(src).at(src)?;
        if let Some(rewritten) = self.rewritten_target(&target) {
            if !self.params.options.rewrite_symlinks {
                return self.conflict(
                    tidy,
                    format!(
                        "Symlink to image detected at '{}' ({})",
                        src.display(),
                        target.display()
                    ),
                );
            }
            debug!("Rewriting {} -> {} as {}", tidy.display(), target.display(), rewritten.display());
            target = rewritten;
        }

        let existing = EntryType::of(dst);
        if existing == EntryType::Dir {
            return self.conflict(
                tidy,
                format!(
                    "Cannot overwrite directory '{}' with symlink '{}'",
                    dst.display(),
                    src.display()
                ),
            );
        }
        if self.is_check {
            return Ok(());
        }

        if existing != EntryType::Nothing {
            unlink(dst)?;
        }
        std::os::unix::fs::symlink(&target, dst).at(dst)?;

        let src_meta = fs::symlink_metadata(src).at(src)?;
        let (uid, gid, _) = self.ownership_for(src, &src_meta);
        let created = fs::symlink_metadata(dst).at(dst)?;
        apply_ownership(dst, &created, uid, gid, false)?;

        if self.params.options.preserve_mtimes {
            filetime::set_symlink_file_times(
                dst,
                FileTime::from_last_access_time(&src_meta),
                FileTime::from_last_modification_time(&src_meta),
            )
            .at(dst)?;
        }

        let meta = fs::symlink_metadata(dst).at(dst)?;
        self.record(ContentsEntry::Sym(ContentsSym {
            path: tidy.to_path_buf(),
            target,
            mtime: meta.mtime(),
        }))?;

        let arrows = if existing == EntryType::Nothing { ">>>" } else { "<<<" };
        self.display(format!("{} [sym] {}", arrows, tidy.display()));
        Ok(())
    }
}

fn file_name(path: &Path) -> Result<&OsStr> {
    path.file_name()
        .ok_or_else(|| Error::Merge(format!("'{}' has no file name", path.display())))
}

fn parent(path: &Path) -> Result<&Path> {
    path.parent()
        .ok_or_else(|| Error::Merge(format!("'{}' has no parent directory", path.display())))
}
