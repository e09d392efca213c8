// SPDX-License-Identifier: MIT OR Apache-2.0
//! Context record data model: the record/metadata/relationship/location types
//! shared by every backend and the engine, plus canonical serialization and
//! checksumming primitives used to keep independent readers of the store in
//! agreement about what a record's digest means.

mod algorithm;
mod compressed;
mod metadata;
mod record;
mod relationship;
mod location;
mod version;

pub use algorithm::Algorithm;
pub use compressed::{CompressedContext, CompressionStats};
pub use metadata::{CompressionLevel, ContextMetadata, McpStorageInfo};
pub use record::{
    ContextContent, ContextRecord, ContextType, ConversationContent, ConversationTurn,
    KnowledgeContent, SessionContent, TaskContent,
};
pub use relationship::RelationshipEdge;
pub use location::{Service, StorageLocation};
pub use version::{SchemaVersion, SchemaVersionParseError, CURRENT_SCHEMA_VERSION, MIN_SCHEMA_VERSION};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serializes `value` to its canonical textual form for checksumming.
///
/// `serde_json::Map` is backed by a `BTreeMap` unless the crate's
/// `preserve_order` feature is enabled (it is not, anywhere in this
/// workspace), so round-tripping through [`serde_json::Value`] and back to a
/// string yields keys in sorted order at every nesting level. The stability
/// comes from the absence of `preserve_order`, not from any sorting this
/// function does itself, so it must not be changed without keeping that
/// invariant true.
///
/// # Errors
/// Returns an error if `value` cannot be represented as JSON.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let as_value = serde_json::to_value(value)?;
    serde_json::to_string(&as_value)
}

/// Hex-encodes the SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Computes the checksum a [`ContextRecord::checksum`] must hold: the
/// SHA-256 digest of `content`'s canonical serialization (invariant 2).
///
/// # Errors
/// Returns an error if `content` cannot be canonically serialized.
pub fn content_checksum(content: &ContextContent) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(content)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// `true` when `checksum` matches `content`'s canonical digest (invariant 2).
///
/// # Errors
/// Returns an error if `content` cannot be canonically serialized.
pub fn verify_content_checksum(
    content: &ContextContent,
    checksum: &str,
) -> Result<bool, serde_json::Error> {
    Ok(content_checksum(content)? == checksum)
}

/// The charset a syntactically valid record id (and relationship `targetId`)
/// is restricted to: ASCII alphanumerics, `-`, `_`, `.`, and `:`.
fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}

/// `true` when `id` is non-empty and composed only of [`is_id_char`] (invariants 1, 4).
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(is_id_char)
}

/// Builds [`ContextRecord`]s with a correctly computed checksum, deriving the
/// content-addressed `checksum` field through a dedicated constructor rather
/// than leaving callers to compute it by hand.
#[derive(Debug, Clone)]
pub struct ContextRecordBuilder {
    id: String,
    kind: ContextType,
    schema_version: SchemaVersion,
    content: ContextContent,
    metadata: ContextMetadata,
    relationships: Vec<RelationshipEdge>,
    version: u64,
    parent_version: Option<u64>,
}

impl ContextRecordBuilder {
    /// Starts building a brand-new (version 1, no parent) record.
    #[must_use]
    pub fn new(id: impl Into<String>, content: ContextContent, metadata: ContextMetadata) -> Self {
        let kind = content.context_type();
        ContextRecordBuilder {
            id: id.into(),
            kind,
            schema_version: CURRENT_SCHEMA_VERSION,
            content,
            metadata,
            relationships: Vec::new(),
            version: 1,
            parent_version: None,
        }
    }

    /// Overrides the schema version (defaults to [`CURRENT_SCHEMA_VERSION`]).
    #[must_use]
    pub fn schema_version(mut self, schema_version: SchemaVersion) -> Self {
        self.schema_version = schema_version;
        self
    }

    /// Sets the relationship edges.
    #[must_use]
    pub fn relationships(mut self, relationships: Vec<RelationshipEdge>) -> Self {
        self.relationships = relationships;
        self
    }

    /// Sets `version`/`parent_version` directly, for building an update's result
    /// rather than a fresh record.
    #[must_use]
    pub fn version(mut self, version: u64, parent_version: Option<u64>) -> Self {
        self.version = version;
        self.parent_version = parent_version;
        self
    }

    /// Finalizes the record, computing `checksum` over `content`.
    ///
    /// # Errors
    /// Returns an error if `content` cannot be canonically serialized.
    pub fn build(self) -> Result<ContextRecord, serde_json::Error> {
        let checksum = content_checksum(&self.content)?;
        Ok(ContextRecord {
            id: self.id,
            kind: self.kind,
            schema_version: self.schema_version,
            content: self.content,
            metadata: self.metadata,
            relationships: self.relationships,
            version: self.version,
            parent_version: self.parent_version,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": 2});
        let s = canonical_json(&value).unwrap();
        assert_eq!(s, r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn builder_computes_matching_checksum() {
        let now = Utc.timestamp_opt(0, 0).unwrap();
        let content = ContextContent::Task(TaskContent {
            title: "t".to_string(),
            description: "d".to_string(),
            status: "pending".to_string(),
        });
        let metadata = ContextMetadata::new(now, 3, None);
        let record = ContextRecordBuilder::new("task-1", content.clone(), metadata)
            .build()
            .unwrap();
        assert!(verify_content_checksum(&content, &record.checksum).unwrap());
    }

    #[test]
    fn valid_id_rejects_empty_and_bad_chars() {
        assert!(is_valid_id("c1"));
        assert!(is_valid_id("c1:v2.child"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("has space"));
    }
}
