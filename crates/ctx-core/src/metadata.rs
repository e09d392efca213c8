// SPDX-License-Identifier: MIT OR Apache-2.0
//! Context record metadata (spec §3 "Metadata").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How aggressively a record's content has been compressed for storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// Stored uncompressed.
    #[default]
    None,
    /// A light compression pass, favoring retrieval speed.
    Light,
    /// Maximum compression, favoring storage footprint.
    Heavy,
}

/// MCP-facing storage flags nested under metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct McpStorageInfo {
    /// Whether the stored payload is encrypted at rest.
    pub encrypted: bool,
}

/// Metadata carried by every [`crate::ContextRecord`] (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    /// Routing priority, 0 (lowest) to 10 (highest).
    pub priority: u8,
    /// Relevance score in `[0, 1]`.
    pub relevance_score: f64,
    /// Compression level applied to the stored content.
    pub compression_level: CompressionLevel,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last read.
    pub last_accessed: DateTime<Utc>,
    /// When the record's content was last mutated by an update.
    pub modified_at: Option<DateTime<Utc>>,
    /// Time-to-live in seconds, if any.
    pub ttl: Option<u64>,
    /// Derived expiry instant; present iff `ttl` is present (invariant 3).
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether this record has been moved to cold storage.
    pub archived: bool,
    /// Owning principal, if any.
    pub owner: Option<String>,
    /// Access-control permission tags.
    pub permissions: Vec<String>,
    /// Free-form classification tags.
    pub tags: Vec<String>,
    /// Quality score in `[0, 1]`.
    pub quality_score: f64,
    /// Completeness score in `[0, 1]`.
    pub completeness_score: f64,
    /// Accuracy score in `[0, 1]`.
    pub accuracy_score: f64,
    /// Number of times this record has been retrieved.
    pub access_count: u64,
    /// `compressedSize / originalSize`, 1.0 when uncompressed.
    pub compression_ratio: f64,
    /// MCP storage flags.
    pub mcp_storage: McpStorageInfo,
}

impl ContextMetadata {
    /// Builds metadata for a brand-new record at the given instant.
    #[must_use]
    pub fn new(now: DateTime<Utc>, priority: u8, ttl: Option<u64>) -> Self {
        let expires_at = ttl.map(|secs| now + chrono::Duration::seconds(secs as i64));
        ContextMetadata {
            priority,
            relevance_score: 0.0,
            compression_level: CompressionLevel::None,
            created_at: now,
            last_accessed: now,
            modified_at: None,
            ttl,
            expires_at,
            archived: false,
            owner: None,
            permissions: Vec::new(),
            tags: Vec::new(),
            quality_score: 0.0,
            completeness_score: 0.0,
            accuracy_score: 0.0,
            access_count: 0,
            compression_ratio: 1.0,
            mcp_storage: McpStorageInfo::default(),
        }
    }

    /// `true` if `expires_at` is set and in the past relative to `now` (invariant 3).
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Records a read: bumps `access_count` and updates `last_accessed`.
    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn ttl_derives_expires_at() {
        let meta = ContextMetadata::new(at(1_000), 5, Some(60));
        assert_eq!(meta.expires_at, Some(at(1_060)));
    }

    #[test]
    fn no_ttl_means_no_expiry() {
        let meta = ContextMetadata::new(at(1_000), 5, None);
        assert_eq!(meta.expires_at, None);
        assert!(!meta.is_expired(at(10_000_000)));
    }

    #[test]
    fn expiry_is_inclusive_at_boundary() {
        let meta = ContextMetadata::new(at(0), 0, Some(10));
        assert!(meta.is_expired(at(10)));
        assert!(!meta.is_expired(at(9)));
    }

    #[test]
    fn record_access_updates_counters() {
        let mut meta = ContextMetadata::new(at(0), 0, None);
        meta.record_access(at(5));
        meta.record_access(at(6));
        assert_eq!(meta.access_count, 2);
        assert_eq!(meta.last_accessed, at(6));
    }
}
