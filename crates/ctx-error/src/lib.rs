// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the context storage engine.
//!
//! Every error surfaced across crate boundaries carries a stable
//! [`ErrorCode`], a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Build one with [`CtxError::new`] and the
//! fluent `with_*` methods.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Broad error family an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A record or compressed record failed a data-model invariant.
    Validation,
    /// A record (or algorithm variant) is absent from a backend.
    NotFound,
    /// A backend's transport/driver failed.
    BackendUnavailable,
    /// A per-operation deadline was exceeded.
    Timeout,
    /// A decompressed payload's digest didn't match its stored checksum.
    ChecksumMismatch,
    /// Handoff queue misuse or lifecycle violation.
    QueueError,
    /// Engine-level orchestration failure.
    EngineError,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Timeout => "timeout",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::QueueError => "queue_error",
            Self::EngineError => "engine_error",
        };
        f.write_str(s)
    }
}

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string guaranteed not
/// to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// A record or compressed record violated a §3 invariant.
    ValidationInvariantViolation,
    /// `algorithm` is not a member of the codec's closed set.
    ValidationUnknownAlgorithm,
    /// `schemaVersion` is older than this implementation's minimum.
    ValidationSchemaVersionUnsupported,
    /// A query uses a capability (full-text, range, relationship traversal)
    /// the targeted backend's tier doesn't support.
    ValidationQueryUnsupported,

    // -- NotFound --
    /// The record is absent from the backend queried.
    NotFoundRecord,
    /// None of the closed algorithm set's variants were present in the archive probe.
    NotFoundAlgorithmVariant,

    // -- BackendUnavailable --
    /// A backend's transport/driver failed to complete the call.
    BackendUnavailableTransport,

    // -- Timeout --
    /// The per-operation deadline elapsed before completion.
    TimeoutOperation,

    // -- ChecksumMismatch --
    /// Decompressed payload digest disagreed with `CompressedContext.checksum`.
    ChecksumMismatchDigest,

    // -- QueueError --
    /// A second consumer attempted to drain an already-consumed queue.
    QueueAlreadyConsumed,
    /// `enqueue` was rejected because the queue's bound was reached.
    QueueFull,
    /// `enqueue` was rejected because `done()` was already called.
    QueueDone,
    /// The queue operation was rejected because `destroy()` already ran.
    QueueDestroyed,
    /// `enqueue` was rejected because the queue is paused and pause disallows enqueue.
    QueuePaused,

    // -- EngineError --
    /// Every backend, including fallbacks, failed the operation.
    EngineAllBackendsFailed,
    /// Fallback was requested but no other backend is configured or healthy.
    EngineNoFallbackServices,
    /// `initialize()` failed.
    EngineInitFailed,
    /// `shutdown()` failed to fully release resources.
    EngineShutdownFailed,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ValidationInvariantViolation
            | Self::ValidationUnknownAlgorithm
            | Self::ValidationSchemaVersionUnsupported
            | Self::ValidationQueryUnsupported => ErrorCategory::Validation,

            Self::NotFoundRecord | Self::NotFoundAlgorithmVariant => ErrorCategory::NotFound,

            Self::BackendUnavailableTransport => ErrorCategory::BackendUnavailable,

            Self::TimeoutOperation => ErrorCategory::Timeout,

            Self::ChecksumMismatchDigest => ErrorCategory::ChecksumMismatch,

            Self::QueueAlreadyConsumed
            | Self::QueueFull
            | Self::QueueDone
            | Self::QueueDestroyed
            | Self::QueuePaused => ErrorCategory::QueueError,

            Self::EngineAllBackendsFailed
            | Self::EngineNoFallbackServices
            | Self::EngineInitFailed
            | Self::EngineShutdownFailed => ErrorCategory::EngineError,
        }
    }

    /// Stable `&'static str` representation, e.g. `"QUEUE_ALREADY_CONSUMED"`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationInvariantViolation => "VALIDATION_INVARIANT_VIOLATION",
            Self::ValidationUnknownAlgorithm => "VALIDATION_UNKNOWN_ALGORITHM",
            Self::ValidationSchemaVersionUnsupported => "VALIDATION_SCHEMA_VERSION_UNSUPPORTED",
            Self::ValidationQueryUnsupported => "VALIDATION_QUERY_UNSUPPORTED",
            Self::NotFoundRecord => "NOT_FOUND_RECORD",
            Self::NotFoundAlgorithmVariant => "NOT_FOUND_ALGORITHM_VARIANT",
            Self::BackendUnavailableTransport => "BACKEND_UNAVAILABLE_TRANSPORT",
            Self::TimeoutOperation => "TIMEOUT_OPERATION",
            Self::ChecksumMismatchDigest => "CHECKSUM_MISMATCH_DIGEST",
            Self::QueueAlreadyConsumed => "QUEUE_ALREADY_CONSUMED",
            Self::QueueFull => "QUEUE_FULL",
            Self::QueueDone => "QUEUE_DONE",
            Self::QueueDestroyed => "QUEUE_DESTROYED",
            Self::QueuePaused => "QUEUE_PAUSED",
            Self::EngineAllBackendsFailed => "ENGINE_ALL_BACKENDS_FAILED",
            Self::EngineNoFallbackServices => "ENGINE_NO_FALLBACK_SERVICES",
            Self::EngineInitFailed => "ENGINE_INIT_FAILED",
            Self::EngineShutdownFailed => "ENGINE_SHUTDOWN_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified engine error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// ```
/// use ctx_error::{CtxError, ErrorCode};
///
/// let err = CtxError::new(ErrorCode::TimeoutOperation, "store timed out")
///     .with_context("op", "store")
///     .with_context("timeout_ms", 30_000);
/// ```
pub struct CtxError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CtxError {
    /// Creates a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attaches a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialization
    /// fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attaches an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// `true` if this error's category must never be retried automatically
    /// (propagation policy, spec §7: validation and checksum failures are
    /// always surfaced, never retried).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Validation | ErrorCategory::ChecksumMismatch
        )
    }
}

impl fmt::Debug for CtxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CtxError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CtxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CtxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of a [`CtxError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CtxErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&CtxError> for CtxErrorDto {
    fn from(err: &CtxError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<CtxErrorDto> for CtxError {
    fn from(dto: CtxErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}
