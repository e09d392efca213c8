// SPDX-License-Identifier: MIT OR Apache-2.0
//! Relationship edges between context records (spec §3 "Relationship edge").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A directed (optionally bidirectional) edge from one context record to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    /// Id of the record this edge points to. Existence is not enforced
    /// (invariant 4: dangling edges are allowed); only syntactic validity is.
    pub target_id: String,
    /// Relationship kind, e.g. `"references"`, `"derived_from"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Edge weight in `[0, 1]`.
    pub weight: f64,
    /// Whether the relationship should be treated as navigable in both directions.
    pub bidirectional: bool,
    /// When the edge was created.
    pub created_at: DateTime<Utc>,
    /// Principal that created the edge, if known.
    pub created_by: Option<String>,
    /// Free-text description of the relationship.
    pub description: Option<String>,
    /// Arbitrary additional edge properties.
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

impl RelationshipEdge {
    /// `true` when `target_id` is syntactically usable as an id: non-empty and
    /// restricted to the same charset as [`crate::is_valid_id`].
    #[must_use]
    pub fn has_valid_target(&self) -> bool {
        crate::is_valid_id(&self.target_id)
    }

    /// `true` when `weight` is within the required range (invariant 6).
    #[must_use]
    pub fn has_valid_weight(&self) -> bool {
        (0.0..=1.0).contains(&self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn edge(target: &str, weight: f64) -> RelationshipEdge {
        RelationshipEdge {
            target_id: target.to_string(),
            kind: "references".to_string(),
            weight,
            bidirectional: false,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            created_by: None,
            description: None,
            properties: None,
        }
    }

    #[test]
    fn validates_target_and_weight() {
        let e = edge("c1", 0.5);
        assert!(e.has_valid_target());
        assert!(e.has_valid_weight());

        let bad_target = edge("", 0.5);
        assert!(!bad_target.has_valid_target());

        let bad_weight = edge("c1", 1.5);
        assert!(!bad_weight.has_valid_weight());
    }
}
