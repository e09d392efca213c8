// SPDX-License-Identifier: MIT OR Apache-2.0
//! Compression and digest codec (spec §4.2 "Codec").
//!
//! `compress`/`decompress` operate over the closed algorithm set re-exported
//! from `ctx-core`; `digest` always uses SHA-256. `decompress_verified`
//! additionally checks a [`CompressedContext`]'s embedded checksum against
//! the decompressed payload, failing with [`CodecError::ChecksumMismatch`]
//! when they disagree — the only point in the codec where a digest mismatch
//! is load-bearing rather than advisory.

use chrono::Utc;
pub use ctx_core::Algorithm;
use ctx_core::{CompressedContext, CompressionStats, ContextMetadata};
use std::io::{Read, Write};

/// Errors produced by compression, decompression, or digest verification.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The requested algorithm isn't a member of the closed set, or the
    /// compressed bytes are malformed for the algorithm claimed.
    #[error("algorithm {0:?} rejected input: {1}")]
    InvalidInput(Algorithm, String),
    /// An I/O error occurred while streaming through the compressor/decompressor.
    #[error("codec I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The decompressed payload's digest did not match the expected checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Digest recorded in the compressed envelope.
        expected: String,
        /// Digest actually computed from the decompressed payload.
        actual: String,
    },
}

/// Hex SHA-256 digest of `data`.
#[must_use]
pub fn digest(data: &[u8]) -> String {
    ctx_core::sha256_hex(data)
}

/// Compresses `data` under `algorithm`, returning the compressed bytes and
/// measured [`CompressionStats`].
///
/// # Errors
/// Returns [`CodecError::Io`] if the underlying compressor fails.
pub fn compress(data: &[u8], algorithm: Algorithm) -> Result<(Vec<u8>, CompressionStats), CodecError> {
    let compressed = match algorithm {
        Algorithm::None => data.to_vec(),
        Algorithm::Lz4 => compress_lz4(data)?,
        Algorithm::Gzip => compress_gzip(data)?,
        Algorithm::Brotli => compress_brotli(data),
        Algorithm::Zstd => compress_zstd(data)?,
    };
    let stats = CompressionStats::new(data.len() as u64, compressed.len() as u64, algorithm, Utc::now());
    Ok((compressed, stats))
}

/// Decompresses `data`, previously produced by [`compress`] under `algorithm`.
///
/// # Errors
/// Returns [`CodecError::Io`] or [`CodecError::InvalidInput`] if `data` is
/// malformed for the claimed algorithm.
pub fn decompress(data: &[u8], algorithm: Algorithm) -> Result<Vec<u8>, CodecError> {
    match algorithm {
        Algorithm::None => Ok(data.to_vec()),
        Algorithm::Lz4 => decompress_lz4(data),
        Algorithm::Gzip => decompress_gzip(data),
        Algorithm::Brotli => decompress_brotli(data),
        Algorithm::Zstd => decompress_zstd(data),
    }
}

/// Decompresses `compressed` and verifies its digest against
/// `compressed.checksum`, failing with [`CodecError::ChecksumMismatch`] when
/// they disagree (spec §4.2).
///
/// # Errors
/// Returns [`CodecError::ChecksumMismatch`] on digest disagreement, or the
/// underlying decompression error otherwise.
pub fn decompress_verified(compressed: &CompressedContext) -> Result<Vec<u8>, CodecError> {
    let plain = decompress(&compressed.data, compressed.algorithm)?;
    let actual = digest(&plain);
    if actual != compressed.checksum {
        return Err(CodecError::ChecksumMismatch {
            expected: compressed.checksum.clone(),
            actual,
        });
    }
    Ok(plain)
}

/// Builds a [`CompressedContext`] envelope by compressing `plain` under
/// `algorithm` and stamping its checksum as the digest of the *uncompressed*
/// payload (the value [`decompress_verified`] re-checks on the way back out).
///
/// # Errors
/// Returns [`CodecError::Io`] if compression fails.
pub fn compress_context(
    context_id: impl Into<String>,
    plain: &[u8],
    algorithm: Algorithm,
    preserved_metadata: ContextMetadata,
) -> Result<CompressedContext, CodecError> {
    let (data, stats) = compress(plain, algorithm)?;
    let checksum = digest(plain);
    Ok(CompressedContext {
        context_id: context_id.into(),
        algorithm,
        data,
        stats,
        preserved_metadata,
        checksum,
        verified: false,
    })
}

fn compress_lz4(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    // lz4's block API needs the original length on the way back out; the
    // frame/stream API isn't exposed by this crate version, so the length is
    // prefixed as a 4-byte little-endian header ahead of the compressed block.
    let block = lz4::block::compress(data, None, false)
        .map_err(|e| CodecError::InvalidInput(Algorithm::Lz4, e.to_string()))?;
    let mut out = Vec::with_capacity(4 + block.len());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&block);
    Ok(out)
}

fn decompress_lz4(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() < 4 {
        return Err(CodecError::InvalidInput(
            Algorithm::Lz4,
            "missing length header".to_string(),
        ));
    }
    let (header, body) = data.split_at(4);
    let original_len = u32::from_le_bytes(header.try_into().expect("checked len")) as usize;
    lz4::block::decompress(body, Some(original_len as i32))
        .map_err(|e| CodecError::InvalidInput(Algorithm::Lz4, e.to_string()))
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    use flate2::read::GzDecoder;
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

fn compress_brotli(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let params = brotli::enc::BrotliEncoderParams::default();
    brotli::BrotliCompress(&mut &data[..], &mut out, &params).expect("brotli compression is infallible for in-memory buffers");
    out
}

fn decompress_brotli(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    brotli::BrotliDecompress(&mut &data[..], &mut out)
        .map_err(|e| CodecError::InvalidInput(Algorithm::Brotli, e.to_string()))?;
    Ok(out)
}

fn compress_zstd(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    Ok(zstd::stream::encode_all(data, 0)?)
}

fn decompress_zstd(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    Ok(zstd::stream::decode_all(data)?)
}
