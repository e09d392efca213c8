// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dotted schema version parsing and comparison.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// The oldest `schemaVersion` this implementation still accepts.
///
/// Records below this are rejected at the validator boundary (spec §3:
/// "records older than the current implementation's minimum are rejected").
pub const MIN_SCHEMA_VERSION: SchemaVersion = SchemaVersion {
    major: 1,
    minor: 0,
    patch: 0,
};

/// The schema version this implementation writes for new records.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion {
    major: 1,
    minor: 2,
    patch: 0,
};

/// A dotted `major.minor.patch` schema version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Patch component.
    pub patch: u32,
}

/// Errors produced while parsing a [`SchemaVersion`].
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("invalid schema version {0:?}: expected \"major.minor.patch\"")]
pub struct SchemaVersionParseError(pub String);

impl FromStr for SchemaVersion {
    type Err = SchemaVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SchemaVersionParseError(s.to_string()));
        };
        let parse = |p: &str| p.parse::<u32>().map_err(|_| SchemaVersionParseError(s.to_string()));
        Ok(SchemaVersion {
            major: parse(major)?,
            minor: parse(minor)?,
            patch: parse(patch)?,
        })
    }
}

impl TryFrom<String> for SchemaVersion {
    type Error = SchemaVersionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SchemaVersion> for String {
    fn from(v: SchemaVersion) -> Self {
        v.to_string()
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl SchemaVersion {
    /// Returns `true` if this version is at least as new as [`MIN_SCHEMA_VERSION`].
    #[must_use]
    pub fn is_supported(&self) -> bool {
        *self >= MIN_SCHEMA_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_dotted_version() {
        let v: SchemaVersion = "1.2.3".parse().unwrap();
        assert_eq!(v, SchemaVersion { major: 1, minor: 2, patch: 3 });
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn rejects_malformed_version() {
        assert!("1.2".parse::<SchemaVersion>().is_err());
        assert!("1.2.3.4".parse::<SchemaVersion>().is_err());
        assert!("a.b.c".parse::<SchemaVersion>().is_err());
    }

    #[test]
    fn ordering_and_support() {
        let old = SchemaVersion { major: 0, minor: 9, patch: 0 };
        let current = CURRENT_SCHEMA_VERSION;
        assert!(old < current);
        assert!(!old.is_supported());
        assert!(current.is_supported());
        assert!(MIN_SCHEMA_VERSION.is_supported());
    }
}
