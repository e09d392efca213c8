// SPDX-License-Identifier: MIT OR Apache-2.0
//! The closed set of compression algorithms recognized anywhere in the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A compression algorithm from the engine's closed set.
///
/// This type lives in `ctx-core` rather than `ctx-codec` because both the
/// data model (`CompressedContext::algorithm`) and the codec need it, and
/// the model crate sits beneath the codec crate in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// No compression; payload is stored as-is.
    None,
    /// LZ4 block compression, favors speed over ratio.
    Lz4,
    /// DEFLATE/gzip, the ubiquitous baseline.
    Gzip,
    /// Brotli, favors ratio for text-heavy payloads.
    Brotli,
    /// Zstandard, balanced speed/ratio with a wide level range.
    Zstd,
}

impl Algorithm {
    /// All members of the closed set, in a stable order used for probing
    /// (e.g. the archive backend's `retrieveCompressed` extension scan).
    pub const ALL: [Algorithm; 5] = [
        Algorithm::None,
        Algorithm::Lz4,
        Algorithm::Gzip,
        Algorithm::Brotli,
        Algorithm::Zstd,
    ];

    /// The filename extension this algorithm is stored under on the archive backend.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Lz4 => "lz4",
            Algorithm::Gzip => "gzip",
            Algorithm::Brotli => "brotli",
            Algorithm::Zstd => "zstd",
        }
    }

    /// Parses an algorithm from the extension produced by [`Algorithm::extension`].
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Algorithm> {
        Algorithm::ALL.into_iter().find(|a| a.extension() == ext)
    }
}

impl Default for Algorithm {
    /// Zstandard is the engine's default archive compression algorithm
    /// (spec §6 `filesystem.defaultAlgorithm`).
    fn default() -> Self {
        Algorithm::Zstd
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_round_trips() {
        for algo in Algorithm::ALL {
            let ext = algo.extension();
            assert_eq!(Algorithm::from_extension(ext), Some(algo));
        }
    }

    #[test]
    fn unknown_extension_is_none() {
        assert_eq!(Algorithm::from_extension("lzma"), None);
    }
}
