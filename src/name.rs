// src/name.rs

//! Validated names for categories, packages and slots
//!
//! Names appear as directory basenames inside the index, so they are
//! restricted to a conservative character set. Anything that fails to
//! validate is reported as [`Error::InvalidName`] and skipped by scanners.

use crate::error::{Error, Result};
use crate::version::VersionSpec;
use std::fmt;
use std::str::FromStr;

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '+' | '_' | '.' | '-')
}

fn validate(kind: &str, s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::InvalidName(format!("empty {} name", kind)));
    }
    if s.starts_with('-') || s.starts_with('.') {
        return Err(Error::InvalidName(format!(
            "{} name '{}' must not start with '-' or '.'",
            kind, s
        )));
    }
    if let Some(c) = s.chars().find(|c| !valid_name_char(*c)) {
        return Err(Error::InvalidName(format!(
            "{} name '{}' contains invalid character '{}'",
            kind, s, c
        )));
    }
    Ok(())
}

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(s: &str) -> Result<Self> {
                s.parse()
            }
        }
    };
}

name_type!(
    /// A category such as `sys-apps`
    CategoryName
);
name_type!(
    /// A package name such as `coreutils`
    PackageName
);
name_type!(
    /// A slot, the secondary version axis
    SlotName
);

impl FromStr for CategoryName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        validate("category", s)?;
        Ok(Self(s.to_string()))
    }
}

impl FromStr for SlotName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        validate("slot", s)?;
        Ok(Self(s.to_string()))
    }
}

impl FromStr for PackageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        validate("package", s)?;

        // "foo-1.2" would be ambiguous with a versioned atom
        if let Some(pos) = s.rfind('-') {
            let tail = &s[pos + 1..];
            if tail.parse::<VersionSpec>().is_ok() {
                return Err(Error::InvalidName(format!(
                    "package name '{}' must not end in a version",
                    s
                )));
            }
        }

        Ok(Self(s.to_string()))
    }
}

/// `category/package`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    pub category: CategoryName,
    pub package: PackageName,
}

impl QualifiedName {
    pub fn new(category: CategoryName, package: PackageName) -> Self {
        Self { category, package }
    }

    /// Name of the package's directory under `data/`
    pub fn data_dir_name(&self) -> String {
        format!("{}---{}", self.category, self.package)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.package)
    }
}

impl FromStr for QualifiedName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (cat, pkg) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidName(format!("'{}' is not of the form category/package", s)))?;
        Ok(Self {
            category: cat.parse()?,
            package: pkg.parse()?,
        })
    }
}
