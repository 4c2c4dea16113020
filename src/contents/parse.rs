// src/contents/parse.rs

//! Streaming Contents Store reader
//!
//! The reader is line-granular: a malformed line is logged and skipped and
//! never affects its neighbours. Results are delivered through a
//! [`ContentsVisitor`]; nothing is accumulated here.

use super::{ContentsDir, ContentsEntry, ContentsFile, ContentsMisc, ContentsSym};
use crate::error::{IoContext, Result};
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::str::Chars;
use tracing::{debug, warn};

/// Receives parsed entries, one callback per channel
pub trait ContentsVisitor {
    fn on_file(&mut self, entry: ContentsFile);
    fn on_dir(&mut self, entry: ContentsDir);
    fn on_sym(&mut self, entry: ContentsSym);

    /// Fifos, device nodes and other recorded-but-inert entries
    fn on_misc(&mut self, entry: ContentsMisc) {
        debug!("Ignoring misc contents entry {}", entry.path.display());
    }
}

/// Collects everything, in file order
impl ContentsVisitor for Vec<ContentsEntry> {
    fn on_file(&mut self, entry: ContentsFile) {
        self.push(ContentsEntry::File(entry));
    }

    fn on_dir(&mut self, entry: ContentsDir) {
        self.push(ContentsEntry::Dir(entry));
    }

    fn on_sym(&mut self, entry: ContentsSym) {
        self.push(ContentsEntry::Sym(entry));
    }

    fn on_misc(&mut self, entry: ContentsMisc) {
        self.push(ContentsEntry::Misc(entry));
    }
}

/// One whitespace-delimited field, unescaped to raw bytes
#[derive(Default)]
struct Field {
    text: Vec<u8>,
    /// Offset in `text` of the first unescaped `=`
    split: Option<usize>,
}

impl Field {
    fn key_value(&self) -> Option<(&[u8], &[u8])> {
        self.split.map(|i| (&self.text[..i], &self.text[i + 1..]))
    }
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

/// Consume two hex digits following `\x`, if present
fn hex_byte(chars: &mut Chars<'_>) -> Option<u8> {
    let digits = chars.as_str().as_bytes().get(..2)?;
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    let byte = u8::from_str_radix(std::str::from_utf8(digits).ok()?, 16).ok()?;
    chars.nth(1);
    Some(byte)
}

/// Split a line on unescaped spaces, resolving `\n`, `\xNN` and `\X`
/// escapes
///
/// Returns `None` for a line ending in a lone backslash.
fn tokenize(line: &str) -> Option<Vec<Field>> {
    let mut fields = Vec::new();
    let mut current = Field::default();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next()? {
                'n' => current.text.push(b'\n'),
                'x' => match hex_byte(&mut chars) {
                    Some(byte) => current.text.push(byte),
                    None => current.text.push(b'x'),
                },
                other => push_char(&mut current.text, other),
            },
            ' ' => {
                if !current.text.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            '=' if current.split.is_none() => {
                current.split = Some(current.text.len());
                current.text.push(b'=');
            }
            other => push_char(&mut current.text, other),
        }
    }

    if !current.text.is_empty() {
        fields.push(current);
    }
    Some(fields)
}

/// A line broken into its type, path and keyed tokens
struct ParsedLine {
    kind: String,
    path: OsString,
    tokens: HashMap<String, OsString>,
}

fn split_line(line: &str, source: &str) -> Option<ParsedLine> {
    let Some(fields) = tokenize(line) else {
        warn!(tag = "contents.invalid", "Malformed line '{}' in '{}'", line, source);
        return None;
    };

    let mut tokens = HashMap::new();
    let mut insert = |key: &[u8], value: &[u8]| {
        let key = String::from_utf8_lossy(key).into_owned();
        if tokens.insert(key.clone(), OsString::from_vec(value.to_vec())).is_some() {
            warn!(
                tag = "contents.duplicate",
                "Duplicate token '{}' on line '{}' in '{}'", key, line, source
            );
        }
    };

    // Older stores key every field, including type and path
    let legacy = fields
        .first()
        .and_then(Field::key_value)
        .is_some_and(|(k, _)| k == b"type");

    let keyed = if legacy {
        &fields[..]
    } else {
        match fields.len() {
            0 => return None,
            1 => {
                warn!(tag = "contents.no_key", "No path found on line '{}' in '{}'", line, source);
                return None;
            }
            _ => {
                insert(b"type", &fields[0].text);
                insert(b"path", &fields[1].text);
                &fields[2..]
            }
        }
    };

    for field in keyed {
        match field.key_value() {
            Some((key, value)) => insert(key, value),
            None => {
                warn!(tag = "contents.invalid", "Malformed line '{}' in '{}'", line, source);
                return None;
            }
        }
    }

    let kind = tokens.remove("type");
    let path = tokens.remove("path");
    match (kind, path) {
        (Some(kind), Some(path)) => Some(ParsedLine {
            kind: kind.to_string_lossy().into_owned(),
            path,
            tokens,
        }),
        (None, _) => {
            warn!(tag = "contents.no_key", "No key 'type' found on line '{}' in '{}'", line, source);
            None
        }
        (_, None) => {
            warn!(tag = "contents.no_key", "No key 'path' found on line '{}' in '{}'", line, source);
            None
        }
    }
}

fn parse_line(line: &str, source: &str, visitor: &mut dyn ContentsVisitor) {
    let Some(mut parsed) = split_line(line, source) else {
        return;
    };

    let mut required = |key: &str| {
        let value = parsed.tokens.remove(key);
        if value.is_none() {
            warn!(
                tag = "contents.no_key",
                "No key '{}' found on {} line '{}' in '{}'", key, parsed.kind, line, source
            );
        }
        value
    };

    let mtime = |value: Option<OsString>| -> Option<i64> {
        let value = value?;
        match value.to_str().and_then(|v| v.parse().ok()) {
            Some(t) => Some(t),
            None => {
                warn!(
                    tag = "contents.invalid",
                    "Bad mtime '{}' on line '{}' in '{}'",
                    value.to_string_lossy(),
                    line,
                    source
                );
                None
            }
        }
    };

    let path = PathBuf::from(std::mem::take(&mut parsed.path));
    match parsed.kind.as_str() {
        "file" | "obj" => {
            let Some(md5) = required("md5") else { return };
            let Ok(md5) = md5.into_string() else {
                warn!(tag = "contents.invalid", "Bad md5 on line '{}' in '{}'", line, source);
                return;
            };
            let Some(mtime) = mtime(required("mtime")) else { return };
            visitor.on_file(ContentsFile { path, md5, mtime });
        }
        "dir" => visitor.on_dir(ContentsDir { path }),
        "sym" => {
            let Some(target) = required("target") else { return };
            let Some(mtime) = mtime(required("mtime")) else { return };
            visitor.on_sym(ContentsSym {
                path,
                target: PathBuf::from(target),
                mtime,
            });
        }
        "fif" | "dev" | "misc" => visitor.on_misc(ContentsMisc {
            path,
            kind: parsed.kind.clone(),
        }),
        other => warn!(
            tag = "contents.unknown_type",
            "Unknown type '{}' found on line '{}' in '{}'", other, line, source
        ),
    }
}

fn visit_line(line: &str, source: &str, visitor: &mut dyn ContentsVisitor) {
    let trimmed = line.trim_end_matches('\r');
    if trimmed.trim().is_empty() || trimmed.starts_with('#') {
        return;
    }
    parse_line(trimmed, source, visitor);
}

/// Parse Contents Store text, reporting problems against `source`
pub fn parse_contents_str(text: &str, source: &str, visitor: &mut dyn ContentsVisitor) {
    for line in text.lines() {
        visit_line(line, source, visitor);
    }
}

/// Parse raw Contents Store bytes; a line that is not UTF-8 is skipped
pub fn parse_contents_bytes(bytes: &[u8], source: &str, visitor: &mut dyn ContentsVisitor) {
    for (number, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        match std::str::from_utf8(raw) {
            Ok(line) => visit_line(line, source, visitor),
            Err(e) => warn!(
                tag = "contents.invalid",
                "Line {} of '{}' is not valid UTF-8: {}",
                number + 1,
                source,
                e
            ),
        }
    }
}

/// Parse the Contents Store at `path`
///
/// A missing or non-regular file is logged and produces no callbacks.
pub fn parse_contents(path: &Path, visitor: &mut dyn ContentsVisitor) -> Result<()> {
    let is_file = fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
    if !is_file {
        warn!(
            tag = "contents.skipping",
            "Contents file '{}' not a regular file, skipping",
            path.display()
        );
        return Ok(());
    }

    let bytes = fs::read(path).at(path)?;
    parse_contents_bytes(&bytes, &path.to_string_lossy(), visitor);
    Ok(())
}

/// Convenience wrapper collecting every entry in file order
pub fn read_contents(path: &Path) -> Result<Vec<ContentsEntry>> {
    let mut entries = Vec::new();
    parse_contents(path, &mut entries)?;
    Ok(entries)
}
