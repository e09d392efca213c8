// SPDX-License-Identifier: MIT OR Apache-2.0
//! The query model shared across backends (spec §4.3 "Query capabilities are tiered").

use serde::{Deserialize, Serialize};

/// Default traversal depth for relationship queries when unspecified.
pub const DEFAULT_RELATIONSHIP_DEPTH: u32 = 2;

/// A single equality or range predicate over a metadata/content field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryPredicate {
    /// `field == value`.
    Equals {
        /// Field name, e.g. `"metadata.owner"`.
        field: String,
        /// Value to match.
        value: serde_json::Value,
    },
    /// `min <= field <= max` (either bound may be open).
    Range {
        /// Field name.
        field: String,
        /// Inclusive lower bound, if any.
        min: Option<serde_json::Value>,
        /// Inclusive upper bound, if any.
        max: Option<serde_json::Value>,
    },
}

/// A query against a backend's records.
///
/// - The memory backend (C3) only supports [`Query::is_simple`] queries plus
///   sort/limit/offset.
/// - The indexed backend (C4) additionally supports [`QueryPredicate::Range`],
///   `full_text`, and `relationship_seed` traversal.
/// - The archive backend (C5) supports none of the above beyond id lookup and
///   reports [`ctx_error::ErrorCode::ValidationQueryUnsupported`] for the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    /// Equality/range predicates, implicitly ANDed together.
    pub predicates: Vec<QueryPredicate>,
    /// Full-text search string, if any.
    pub full_text: Option<String>,
    /// Seed id for a bounded relationship-graph traversal.
    pub relationship_seed: Option<String>,
    /// Traversal depth, meaningful only with `relationship_seed` set.
    pub relationship_depth: u32,
    /// Field to sort results by.
    pub sort_by: Option<String>,
    /// Sort descending instead of ascending.
    pub sort_descending: bool,
    /// Maximum number of results to return.
    pub limit: Option<usize>,
    /// Number of leading results to skip.
    pub offset: Option<usize>,
}

impl Query {
    /// Builds an empty, unbounded query (matches everything).
    #[must_use]
    pub fn new() -> Self {
        Query {
            relationship_depth: DEFAULT_RELATIONSHIP_DEPTH,
            ..Default::default()
        }
    }

    /// `true` if this query uses only predicate filtering plus sort/limit/offset
    /// — the tier the memory backend can answer (spec §4.3).
    #[must_use]
    pub fn is_simple(&self) -> bool {
        self.full_text.is_none() && self.relationship_seed.is_none()
    }

    /// `true` if this query asks for a relationship-graph traversal.
    #[must_use]
    pub fn is_relationship_traversal(&self) -> bool {
        self.relationship_seed.is_some()
    }
}

/// Which query tiers a backend can answer, used by the engine to decide
/// whether to route a query to it or report it unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryCapability {
    /// Simple predicate filtering plus sort/limit/offset only (Memory).
    Simple,
    /// Simple, range predicates, full-text search, and bounded relationship
    /// traversal (Indexed).
    Full,
    /// Id lookup only; everything else is `ValidationQueryUnsupported` (Archive).
    IdOnly,
}

impl QueryCapability {
    /// `true` if a backend advertising this capability can answer `query`.
    #[must_use]
    pub fn supports(self, query: &Query) -> bool {
        match self {
            QueryCapability::Simple => query.is_simple(),
            QueryCapability::Full => true,
            QueryCapability::IdOnly => {
                query.predicates.is_empty() && query.is_simple() && query.relationship_seed.is_none()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_query_detection() {
        let mut q = Query::new();
        assert!(q.is_simple());
        q.full_text = Some("hello".to_string());
        assert!(!q.is_simple());
    }

    #[test]
    fn memory_capability_rejects_full_text() {
        let mut q = Query::new();
        q.full_text = Some("hello".to_string());
        assert!(!QueryCapability::Simple.supports(&q));
        assert!(QueryCapability::Full.supports(&q));
    }

    #[test]
    fn archive_capability_rejects_everything_but_plain_lookup() {
        let q = Query::new();
        assert!(QueryCapability::IdOnly.supports(&q));
        let mut with_predicate = Query::new();
        with_predicate.predicates.push(QueryPredicate::Equals {
            field: "owner".to_string(),
            value: serde_json::json!("alice"),
        });
        assert!(!QueryCapability::IdOnly.supports(&with_predicate));
    }
}
