// src/contents/writer.rs

use super::ContentsEntry;
use crate::error::{IoContext, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Appends lines to a new Contents Store
pub struct ContentsWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ContentsWriter {
    /// Create (or truncate) the contents file at `path`
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).at(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_entry(&mut self, entry: &ContentsEntry) -> Result<()> {
        writeln!(self.out, "{}", entry).at(&self.path)
    }

    /// Flush and sync to disk
    pub fn finish(self) -> Result<()> {
        let file = self
            .out
            .into_inner()
            .map_err(|e| crate::Error::io_at(&self.path, e.into_error()))?;
        file.sync_all().at(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contents::{read_contents, ContentsDir, ContentsFile};
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("contents");

        let entries = vec![
            ContentsEntry::Dir(ContentsDir {
                path: PathBuf::from("/etc"),
            }),
            ContentsEntry::File(ContentsFile {
                path: PathBuf::from("/etc/with space.conf"),
                md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
                mtime: 1_700_000_000,
            }),
        ];

        let mut writer = ContentsWriter::create(&path).unwrap();
        for entry in &entries {
            writer.write_entry(entry).unwrap();
        }
        writer.finish().unwrap();

        assert_eq!(read_contents(&path).unwrap(), entries);
    }
}
