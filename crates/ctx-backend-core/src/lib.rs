// SPDX-License-Identifier: MIT OR Apache-2.0
//! The shared backend trait implemented by the memory, indexed, and archive
//! backends (spec §4.3), plus the partial-update and query types it shares
//! across all three.
//!
//! Polymorphism over backends: the engine holds backends behind this trait,
//! never as concrete fields, so routing and fallback treat Memory, Indexed,
//! and Archive identically (spec §9 "Polymorphism over backends").

mod query;

pub use query::{Query, QueryCapability, QueryPredicate, DEFAULT_RELATIONSHIP_DEPTH};

use async_trait::async_trait;
use ctx_core::{ContextContent, ContextRecord, Service, StorageLocation};
use ctx_error::CtxError;
use serde::{Deserialize, Serialize};

/// A sparse patch applied by `update`'s read-merge-validate-write cycle
/// (spec §4.3, §4.5 "Update semantics").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialUpdate {
    /// Replacement content, if the caller is updating it.
    pub content: Option<ContextContent>,
    /// New priority, if changed.
    pub priority: Option<u8>,
    /// New relevance score, if changed.
    pub relevance_score: Option<f64>,
    /// New archived flag, if changed.
    pub archived: Option<bool>,
    /// New owner, if changed.
    pub owner: Option<String>,
    /// New tag list, if changed (replaces, does not merge).
    pub tags: Option<Vec<String>>,
    /// New ttl in seconds, if changed.
    pub ttl: Option<u64>,
}

impl PartialUpdate {
    /// `true` if this patch touches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.priority.is_none()
            && self.relevance_score.is_none()
            && self.archived.is_none()
            && self.owner.is_none()
            && self.tags.is_none()
            && self.ttl.is_none()
    }
}

/// A backend's static identity, surfaced for logging and metrics labeling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendIdentity {
    /// Which storage tier this is.
    pub service: Service,
}

/// The operation surface every backend exposes (spec §4.3 table).
///
/// `retrieve`/`update` report "not found" as `Ok(None)`/`Ok(false)` rather
/// than an error: per the §4.4 failure model, `NotFound` is a normal result,
/// not an error, for routing purposes. Backends fail only with
/// [`ctx_error::ErrorCategory::BackendUnavailable`] (transport) or
/// [`ctx_error::ErrorCategory::Validation`] (bad input).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Static identity of this backend.
    fn identity(&self) -> BackendIdentity;

    /// Which query tier this backend can answer (spec §4.3).
    fn query_capability(&self) -> QueryCapability;

    /// Stores `record`, idempotent by `(id, version)`.
    async fn store(&self, record: &ContextRecord) -> Result<StorageLocation, CtxError>;

    /// Retrieves a record by id. `Ok(None)` means absent or expired.
    async fn retrieve(&self, id: &str) -> Result<Option<ContextRecord>, CtxError>;

    /// Applies `partial` to the record at `id` via read-merge-validate-write.
    /// Returns `Ok(true)` if a record was found and updated, `Ok(false)` if
    /// absent.
    async fn update(&self, id: &str, partial: &PartialUpdate) -> Result<bool, CtxError>;

    /// Deletes the record at `id`. Absence is a success (idempotent).
    async fn delete(&self, id: &str) -> Result<(), CtxError>;

    /// Executes `query`. Returns
    /// [`ctx_error::ErrorCode::ValidationQueryUnsupported`] if `query` exceeds
    /// [`Backend::query_capability`].
    async fn query(&self, query: &Query) -> Result<Vec<ContextRecord>, CtxError>;

    /// Side-effect-free liveness probe.
    async fn health_check(&self) -> bool;

    /// Releases any resources held by this backend (connections, file
    /// handles). The engine calls this during shutdown in the fixed order
    /// Archive → Indexed → Memory (spec §5 "Shared resources"). Backends
    /// with nothing to release can rely on the default no-op.
    async fn shutdown(&self) -> Result<(), CtxError> {
        Ok(())
    }
}

/// Convenience used by backend implementations to reject queries beyond
/// their tier with the right error code.
pub fn check_query_capability(capability: QueryCapability, query: &Query) -> Result<(), CtxError> {
    if capability.supports(query) {
        Ok(())
    } else {
        Err(CtxError::new(
            ctx_error::ErrorCode::ValidationQueryUnsupported,
            "query exceeds this backend's supported tier",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_update_empty_detection() {
        assert!(PartialUpdate::default().is_empty());
        let patch = PartialUpdate {
            priority: Some(5),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn capability_check_rejects_unsupported_query() {
        let mut q = Query::new();
        q.full_text = Some("x".to_string());
        assert!(check_query_capability(QueryCapability::Simple, &q).is_err());
        assert!(check_query_capability(QueryCapability::Full, &q).is_ok());
    }
}
