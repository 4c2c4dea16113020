// src/version.rs

//! Version parsing and comparison
//!
//! Versions look like `1.2.3b_rc2_p1-r4`: dotted numbers, an optional
//! letter, an optional pre-release suffix, an optional patch level, an
//! optional `-scm` marker and an optional revision. The bare string `scm`
//! sorts above everything else.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Kinds of version parts, in ascending sort order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum PartKind {
    Alpha,
    Beta,
    Pre,
    Rc,
    Empty,
    Revision,
    Patch,
    Letter,
    Number,
    Scm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Part {
    kind: PartKind,
    value: u64,
}

impl Part {
    fn new(kind: PartKind, value: u64) -> Self {
        Self { kind, value }
    }
}

/// A parsed version
#[derive(Debug, Clone)]
pub struct VersionSpec {
    text: String,
    parts: Vec<Part>,
}

impl VersionSpec {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True if this version carries a `-rN` revision
    pub fn has_revision(&self) -> bool {
        self.parts.iter().any(|p| p.kind == PartKind::Revision)
    }
}

/// Consume a run of digits starting at `*pos`; `None` if there are none
fn take_number(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let start = *pos;
    let mut value: u64 = 0;
    while *pos < bytes.len() && bytes[*pos].is_ascii_digit() {
        value = value
            .saturating_mul(10)
            .saturating_add(u64::from(bytes[*pos] - b'0'));
        *pos += 1;
    }
    (*pos > start).then_some(value)
}

impl FromStr for VersionSpec {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let bad = || Error::InvalidVersion(text.to_string());

        if text == "scm" {
            return Ok(Self {
                text: text.to_string(),
                parts: vec![Part::new(PartKind::Scm, 0)],
            });
        }

        let bytes = text.as_bytes();
        let mut pos = 0;
        let mut parts = Vec::new();

        // numbers
        loop {
            let n = take_number(bytes, &mut pos).ok_or_else(bad)?;
            parts.push(Part::new(PartKind::Number, n));
            if pos < bytes.len() && bytes[pos] == b'.' {
                pos += 1;
                continue;
            }
            break;
        }

        // 1.0 and 1 compare equal
        while parts.len() > 1 && parts.last().map(|p| p.value) == Some(0) {
            parts.pop();
        }

        // letter
        if pos < bytes.len() && bytes[pos].is_ascii_lowercase() {
            parts.push(Part::new(PartKind::Letter, u64::from(bytes[pos])));
            pos += 1;
        }

        // pre-release suffix
        let rest = &text[pos..];
        let suffix = [
            ("_alpha", PartKind::Alpha),
            ("_beta", PartKind::Beta),
            ("_pre", PartKind::Pre),
            ("_rc", PartKind::Rc),
        ]
        .into_iter()
        .find(|(prefix, _)| rest.starts_with(prefix));
        if let Some((prefix, kind)) = suffix {
            pos += prefix.len();
            let n = take_number(bytes, &mut pos).unwrap_or(0);
            parts.push(Part::new(kind, n));
        }

        // patch level
        if text[pos..].starts_with("_p") {
            pos += 2;
            let n = take_number(bytes, &mut pos).unwrap_or(0);
            parts.push(Part::new(PartKind::Patch, n));
        }

        if text[pos..].starts_with("-scm") {
            pos += 4;
            parts.push(Part::new(PartKind::Scm, 0));
        }

        if text[pos..].starts_with("-r") {
            pos += 2;
            let n = take_number(bytes, &mut pos).ok_or_else(bad)?;
            parts.push(Part::new(PartKind::Revision, n));
        }

        if pos != bytes.len() {
            return Err(bad());
        }

        Ok(Self {
            text: text.to_string(),
            parts,
        })
    }
}

impl Ord for VersionSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        let end = Part::new(PartKind::Empty, 0);
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).unwrap_or(&end);
            let b = other.parts.get(i).unwrap_or(&end);
            match a.cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for VersionSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VersionSpec {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VersionSpec {}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}
