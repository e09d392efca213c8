// SPDX-License-Identifier: MIT OR Apache-2.0
//! Context record and compressed-record validation (spec §3 invariants, §4.1 C1).
//!
//! Both [`validate`] and [`validate_compressed`] accumulate every problem
//! found rather than stopping at the first, so callers can report a complete
//! picture of why a record was rejected.

use chrono::{DateTime, Utc};
use ctx_core::{CompressedContext, ContextRecord};
use std::fmt;

/// An individual validation failure found in a record or compressed record.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// `id` is empty or uses characters outside the id charset (invariant 1).
    InvalidId {
        /// The offending id.
        id: String,
    },
    /// `checksum` doesn't match the canonical digest of `content` (invariant 2).
    ChecksumMismatch {
        /// Digest recomputed from `content`.
        expected: String,
        /// Digest stored on the record.
        actual: String,
    },
    /// `schemaVersion` is older than this implementation's minimum.
    SchemaVersionUnsupported {
        /// The record's declared schema version.
        version: String,
    },
    /// `ttl`/`expiresAt` are inconsistent with invariant 3.
    TtlExpiryMismatch {
        /// Human-readable description of the mismatch.
        reason: String,
    },
    /// A relationship edge's `targetId` is not syntactically valid (invariant 4).
    InvalidRelationshipTarget {
        /// The offending target id.
        target_id: String,
    },
    /// A relationship edge's `weight` is outside `[0, 1]` (invariant 6).
    InvalidWeight {
        /// The offending target id, for context.
        target_id: String,
        /// The out-of-range weight.
        weight: f64,
    },
    /// `metadata.priority` is outside `[0, 10]` (invariant 6).
    InvalidPriority {
        /// The out-of-range priority.
        priority: u8,
    },
    /// A `*Score` field is outside `[0, 1]` (invariant 6).
    InvalidScore {
        /// Which score field failed (`"relevanceScore"`, `"qualityScore"`, ...).
        field: &'static str,
        /// The out-of-range value.
        value: f64,
    },
    /// `version`/`parentVersion` are inconsistent with invariant 7.
    VersionParentMismatch {
        /// The record's current version.
        version: u64,
        /// The record's declared parent version.
        parent_version: u64,
    },
    /// `content`'s discriminated variant disagrees with the `type` field.
    ContentTypeMismatch,
    /// `compressionRatio` doesn't match `compressedSize / originalSize` (invariant 5).
    CompressionRatioMismatch {
        /// Ratio computed from the sizes.
        expected: f64,
        /// Ratio stored on the envelope.
        actual: f64,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { id } => write!(f, "invalid id: {id:?}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            Self::SchemaVersionUnsupported { version } => {
                write!(f, "schema version {version} is older than the supported minimum")
            }
            Self::TtlExpiryMismatch { reason } => write!(f, "ttl/expiresAt mismatch: {reason}"),
            Self::InvalidRelationshipTarget { target_id } => {
                write!(f, "relationship targetId is not a valid id: {target_id:?}")
            }
            Self::InvalidWeight { target_id, weight } => {
                write!(f, "relationship to {target_id:?} has out-of-range weight {weight}")
            }
            Self::InvalidPriority { priority } => {
                write!(f, "priority {priority} is outside [0, 10]")
            }
            Self::InvalidScore { field, value } => {
                write!(f, "{field} value {value} is outside [0, 1]")
            }
            Self::VersionParentMismatch {
                version,
                parent_version,
            } => write!(
                f,
                "version {version} is inconsistent with parentVersion {parent_version}"
            ),
            Self::ContentTypeMismatch => write!(f, "content variant does not match record type"),
            Self::CompressionRatioMismatch { expected, actual } => write!(
                f,
                "compressionRatio {actual} does not match computed {expected}"
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

fn push_score(errors: &mut Vec<ValidationError>, field: &'static str, value: f64) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(ValidationError::InvalidScore { field, value });
    }
}

/// Validates a [`ContextRecord`] against every invariant in spec §3.
///
/// Does not check `(id, version)` uniqueness — that's a property of a
/// specific backend's storage, not of the record in isolation — nor does it
/// enforce that relationship targets exist (invariant 4 explicitly allows
/// dangling edges).
///
/// # Errors
/// Returns every [`ValidationError`] found; `Ok(())` only if none are.
pub fn validate(record: &ContextRecord) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !ctx_core::is_valid_id(&record.id) {
        errors.push(ValidationError::InvalidId {
            id: record.id.clone(),
        });
    }

    if !record.schema_version.is_supported() {
        errors.push(ValidationError::SchemaVersionUnsupported {
            version: record.schema_version.to_string(),
        });
    }

    match ctx_core::content_checksum(&record.content) {
        Ok(expected) if expected != record.checksum => {
            errors.push(ValidationError::ChecksumMismatch {
                expected,
                actual: record.checksum.clone(),
            });
        }
        Ok(_) => {}
        Err(_) => errors.push(ValidationError::ChecksumMismatch {
            expected: String::new(),
            actual: record.checksum.clone(),
        }),
    }

    if !record.content_matches_type() {
        errors.push(ValidationError::ContentTypeMismatch);
    }

    validate_ttl(&mut errors, record.metadata.created_at, record.metadata.ttl, record.metadata.expires_at);

    if record.metadata.priority > 10 {
        errors.push(ValidationError::InvalidPriority {
            priority: record.metadata.priority,
        });
    }
    push_score(&mut errors, "relevanceScore", record.metadata.relevance_score);
    push_score(&mut errors, "qualityScore", record.metadata.quality_score);
    push_score(&mut errors, "completenessScore", record.metadata.completeness_score);
    push_score(&mut errors, "accuracyScore", record.metadata.accuracy_score);

    for edge in &record.relationships {
        if !edge.has_valid_target() {
            errors.push(ValidationError::InvalidRelationshipTarget {
                target_id: edge.target_id.clone(),
            });
        }
        if !edge.has_valid_weight() {
            errors.push(ValidationError::InvalidWeight {
                target_id: edge.target_id.clone(),
                weight: edge.weight,
            });
        }
    }

    if let Some(parent_version) = record.parent_version {
        if record.version != parent_version + 1 {
            errors.push(ValidationError::VersionParentMismatch {
                version: record.version,
                parent_version,
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_ttl(
    errors: &mut Vec<ValidationError>,
    created_at: DateTime<Utc>,
    ttl: Option<u64>,
    expires_at: Option<DateTime<Utc>>,
) {
    match (ttl, expires_at) {
        (Some(secs), Some(expires)) => {
            let expected = created_at + chrono::Duration::seconds(secs as i64);
            if expected != expires {
                errors.push(ValidationError::TtlExpiryMismatch {
                    reason: format!("expected expiresAt {expected}, got {expires}"),
                });
            }
        }
        (Some(_), None) => errors.push(ValidationError::TtlExpiryMismatch {
            reason: "ttl is set but expiresAt is missing".to_string(),
        }),
        (None, Some(_)) => errors.push(ValidationError::TtlExpiryMismatch {
            reason: "expiresAt is set without a ttl".to_string(),
        }),
        (None, None) => {}
    }
}

/// Validates a [`CompressedContext`] envelope against invariant 5 (ratio
/// bookkeeping); digest verification itself is `ctx_codec::decompress_verified`'s
/// job, since it requires actually decompressing the payload.
///
/// # Errors
/// Returns every [`ValidationError`] found; `Ok(())` only if none are.
pub fn validate_compressed(compressed: &CompressedContext) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let stats = &compressed.stats;
    let expected_ratio = if stats.original_size == 0 {
        1.0
    } else {
        stats.compressed_size as f64 / stats.original_size as f64
    };
    if (expected_ratio - stats.compression_ratio).abs() > f64::EPSILON {
        errors.push(ValidationError::CompressionRatioMismatch {
            expected: expected_ratio,
            actual: stats.compression_ratio,
        });
    }

    if stats.algorithm != compressed.algorithm {
        errors.push(ValidationError::ContentTypeMismatch);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ctx_core::{ContextContent, ContextMetadata, ContextRecordBuilder, ConversationContent, ConversationTurn};

    fn valid_record() -> ContextRecord {
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let content = ContextContent::Conversation(ConversationContent {
            turns: vec![ConversationTurn {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
        });
        ContextRecordBuilder::new("c1", content, ContextMetadata::new(now, 5, None))
            .build()
            .unwrap()
    }

    #[test]
    fn valid_record_passes() {
        assert!(validate(&valid_record()).is_ok());
    }

    #[test]
    fn empty_id_is_rejected() {
        let mut r = valid_record();
        r.id = String::new();
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ValidationError::InvalidId { .. })));
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let mut r = valid_record();
        r.checksum = "not-the-real-digest".to_string();
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ValidationError::ChecksumMismatch { .. })));
    }

    #[test]
    fn out_of_range_priority_is_rejected() {
        let mut r = valid_record();
        r.metadata.priority = 11;
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ValidationError::InvalidPriority { .. })));
    }

    #[test]
    fn ttl_without_expiry_is_rejected() {
        let mut r = valid_record();
        r.metadata.ttl = Some(60);
        r.metadata.expires_at = None;
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ValidationError::TtlExpiryMismatch { .. })));
    }

    #[test]
    fn version_parent_mismatch_is_rejected() {
        let mut r = valid_record();
        r.version = 5;
        r.parent_version = Some(1);
        let errs = validate(&r).unwrap_err();
        assert!(errs.iter().any(|e| matches!(e, ValidationError::VersionParentMismatch { .. })));
    }

    #[test]
    fn accumulates_multiple_errors() {
        let mut r = valid_record();
        r.id = String::new();
        r.metadata.priority = 20;
        let errs = validate(&r).unwrap_err();
        assert!(errs.len() >= 2);
    }
}
