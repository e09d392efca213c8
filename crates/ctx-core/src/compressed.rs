// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compressed record envelope (spec §3 "Compressed context"), produced by the
//! codec and consumed only by the archive backend.

use crate::algorithm::Algorithm;
use crate::metadata::ContextMetadata;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statistics recorded alongside a compression pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionStats {
    /// Size of the payload before compression.
    pub original_size: u64,
    /// Size of the payload after compression.
    pub compressed_size: u64,
    /// `compressed_size / original_size` (invariant 5).
    pub compression_ratio: f64,
    /// Algorithm used.
    pub algorithm: Algorithm,
    /// When compression completed.
    pub compressed_at: DateTime<Utc>,
    /// Wall time spent decompressing, filled in on the decompress path only.
    pub decompression_time_ms: Option<u64>,
}

impl CompressionStats {
    /// Builds stats from measured sizes, computing the ratio per invariant 5.
    #[must_use]
    pub fn new(
        original_size: u64,
        compressed_size: u64,
        algorithm: Algorithm,
        compressed_at: DateTime<Utc>,
    ) -> Self {
        let compression_ratio = if original_size == 0 {
            1.0
        } else {
            compressed_size as f64 / original_size as f64
        };
        CompressionStats {
            original_size,
            compressed_size,
            compression_ratio,
            algorithm,
            compressed_at,
            decompression_time_ms: None,
        }
    }
}

/// A compressed record as handed off between the codec and the archive backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedContext {
    /// Id of the record this is a compressed form of.
    pub context_id: String,
    /// Algorithm the payload was compressed under.
    pub algorithm: Algorithm,
    /// Opaque compressed bytes.
    pub data: Vec<u8>,
    /// Compression statistics.
    pub stats: CompressionStats,
    /// Metadata subset kept in the clear for indexing without decompression.
    pub preserved_metadata: ContextMetadata,
    /// Hex digest of the decompressed payload, checked by `decompress`.
    pub checksum: String,
    /// Whether `checksum` has been verified against decompressed content.
    pub verified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn stats_compute_ratio() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let stats = CompressionStats::new(1000, 250, Algorithm::Zstd, at);
        assert_eq!(stats.compression_ratio, 0.25);
    }

    #[test]
    fn stats_guard_against_div_by_zero() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let stats = CompressionStats::new(0, 0, Algorithm::None, at);
        assert_eq!(stats.compression_ratio, 1.0);
    }
}
