// src/contents/mod.rs

//! Contents Store: the per-version record of installed entries
//!
//! One line per entry. The first two fields are positional (type and
//! path), the rest are `key=value` tokens separated by single spaces:
//!
//! ```text
//! dir /usr/bin
//! file /usr/bin/foo md5=d41d8cd98f00b204e9800998ecf8427e mtime=1700000000
//! sym /usr/bin/bar target=foo mtime=1700000000
//! ```
//!
//! Values are escaped character by character so that a line can always be
//! split on unescaped spaces. See [`escape`].

mod parse;
mod writer;

pub use parse::{parse_contents, parse_contents_bytes, parse_contents_str, read_contents, ContentsVisitor};
pub use writer::ContentsWriter;

use std::ffi::OsStr;
use std::fmt::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Name of the contents file inside a version directory
pub const CONTENTS_FILE: &str = "contents";

/// A regular file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentsFile {
    pub path: PathBuf,
    pub md5: String,
    pub mtime: i64,
}

/// A directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentsDir {
    pub path: PathBuf,
}

/// A symbolic link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentsSym {
    pub path: PathBuf,
    pub target: PathBuf,
    pub mtime: i64,
}

/// Anything else (fifos, device nodes); recorded but never removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentsMisc {
    pub path: PathBuf,
    pub kind: String,
}

/// One line of a Contents Store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentsEntry {
    File(ContentsFile),
    Dir(ContentsDir),
    Sym(ContentsSym),
    Misc(ContentsMisc),
}

impl ContentsEntry {
    pub fn path(&self) -> &Path {
        match self {
            ContentsEntry::File(f) => &f.path,
            ContentsEntry::Dir(d) => &d.path,
            ContentsEntry::Sym(s) => &s.path,
            ContentsEntry::Misc(m) => &m.path,
        }
    }

    /// The type token written at the start of the line
    pub fn type_name(&self) -> &str {
        match self {
            ContentsEntry::File(_) => "file",
            ContentsEntry::Dir(_) => "dir",
            ContentsEntry::Sym(_) => "sym",
            ContentsEntry::Misc(m) => &m.kind,
        }
    }
}

impl fmt::Display for ContentsEntry {
    /// Formats the entry as a single Contents Store line, without newline
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = escape_os(self.path().as_os_str());
        write!(f, "{} {}", self.type_name(), path)?;
        match self {
            ContentsEntry::File(file) => {
                write!(f, " md5={} mtime={}", escape(&file.md5), file.mtime)
            }
            ContentsEntry::Sym(sym) => {
                write!(f, " target={} mtime={}", escape_os(sym.target.as_os_str()), sym.mtime)
            }
            ContentsEntry::Dir(_) | ContentsEntry::Misc(_) => Ok(()),
        }
    }
}

fn escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '/' | '_' | '.' | '-' => out.push(c),
            '\n' => out.push_str("\\n"),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
}

/// Escape a value for a Contents Store line
///
/// `[A-Za-z0-9/_.-]` pass through, newline becomes `\n`, and every other
/// character is preceded by a backslash.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    escape_into(&mut out, s);
    out
}

/// Like [`escape`], for paths and link targets that need not be UTF-8
///
/// Bytes that are not part of a valid UTF-8 sequence are written as
/// `\xNN`. The writer never escapes a plain `x`, so the reader can tell
/// the two apart.
pub fn escape_os(s: &OsStr) -> String {
    let mut out = String::with_capacity(s.len());
    for chunk in s.as_bytes().utf8_chunks() {
        escape_into(&mut out, chunk.valid());
        for byte in chunk.invalid() {
            let _ = write!(out, "\\x{:02x}", byte);
        }
    }
    out
}
