// SPDX-License-Identifier: MIT OR Apache-2.0
//! The context record itself (spec §3 "Context record") and its type-discriminated content.

use crate::metadata::ContextMetadata;
use crate::relationship::RelationshipEdge;
use crate::version::SchemaVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The closed set of context record kinds (spec §3 `type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    /// A turn-structured conversation transcript.
    Conversation,
    /// A unit of planned or in-flight work.
    Task,
    /// A standalone fact or reference document.
    Knowledge,
    /// A bundle of session-scoped state.
    Session,
}

/// One turn of a conversation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Speaker role, e.g. `"user"`, `"assistant"`, `"system"`.
    pub role: String,
    /// Turn text.
    pub content: String,
}

/// Payload for [`ContextType::Conversation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversationContent {
    /// Ordered turns.
    pub turns: Vec<ConversationTurn>,
}

/// Payload for [`ContextType::Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskContent {
    /// Short task title.
    pub title: String,
    /// Longer task description.
    pub description: String,
    /// Current task status, e.g. `"pending"`, `"done"`.
    pub status: String,
}

/// Payload for [`ContextType::Knowledge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KnowledgeContent {
    /// Subject line or title.
    pub topic: String,
    /// Body text.
    pub body: String,
    /// Free-form source citations.
    pub sources: Vec<String>,
}

/// Payload for [`ContextType::Session`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionContent {
    /// Arbitrary session-scoped key/value state.
    pub state: BTreeMap<String, serde_json::Value>,
}

/// Type-discriminated record content (spec §3 `content`).
///
/// Tagged by the same field name as [`ContextRecord::kind`] so a serialized
/// record carries `"type"` exactly once at the outer level; see
/// [`ContextRecord`]'s manual (De)Serialize-free layout below, where content
/// nests under `content` while `type` drives which variant is expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextContent {
    /// See [`ConversationContent`].
    Conversation(ConversationContent),
    /// See [`TaskContent`].
    Task(TaskContent),
    /// See [`KnowledgeContent`].
    Knowledge(KnowledgeContent),
    /// See [`SessionContent`].
    Session(SessionContent),
}

impl ContextContent {
    /// The [`ContextType`] this content variant corresponds to.
    #[must_use]
    pub fn context_type(&self) -> ContextType {
        match self {
            ContextContent::Conversation(_) => ContextType::Conversation,
            ContextContent::Task(_) => ContextType::Task,
            ContextContent::Knowledge(_) => ContextType::Knowledge,
            ContextContent::Session(_) => ContextType::Session,
        }
    }
}

/// An immutable-by-convention, versioned, checksummed unit of content (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    /// Opaque stable identifier, unique within the store.
    pub id: String,
    /// Discriminator; must agree with `content`'s variant.
    #[serde(rename = "type")]
    pub kind: ContextType,
    /// Dotted schema version this record was written under.
    pub schema_version: SchemaVersion,
    /// Type-discriminated payload.
    pub content: ContextContent,
    /// Record metadata.
    pub metadata: ContextMetadata,
    /// Ordered relationship edges to other records.
    pub relationships: Vec<RelationshipEdge>,
    /// Monotonically increasing version number for this `id`.
    pub version: u64,
    /// Version this record was derived from, if any.
    pub parent_version: Option<u64>,
    /// Hex digest over the canonical serialization of `content` (invariant 2).
    pub checksum: String,
}

impl ContextRecord {
    /// `true` if `content`'s variant agrees with `kind`.
    #[must_use]
    pub fn content_matches_type(&self) -> bool {
        self.content.context_type() == self.kind
    }

    /// Applies the version-bump semantics of invariant 7: increments `version`,
    /// sets `parent_version` to the prior version, and stamps `modified_at`.
    /// The checksum is left untouched — the caller recomputes it over the new
    /// `content` via [`crate::content_checksum`] before persisting.
    pub fn bump_version(&mut self, now: DateTime<Utc>) {
        self.parent_version = Some(self.version);
        self.version += 1;
        self.metadata.modified_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::CURRENT_SCHEMA_VERSION;
    use chrono::TimeZone;

    fn sample(now: DateTime<Utc>) -> ContextRecord {
        ContextRecord {
            id: "c1".to_string(),
            kind: ContextType::Conversation,
            schema_version: CURRENT_SCHEMA_VERSION,
            content: ContextContent::Conversation(ConversationContent {
                turns: vec![ConversationTurn {
                    role: "user".to_string(),
                    content: "hi".to_string(),
                }],
            }),
            metadata: ContextMetadata::new(now, 9, None),
            relationships: Vec::new(),
            version: 1,
            parent_version: None,
            checksum: "deadbeef".to_string(),
        }
    }

    #[test]
    fn content_type_agrees_with_kind() {
        let now = Utc.timestamp_opt(0, 0).unwrap();
        assert!(sample(now).content_matches_type());
    }

    #[test]
    fn bump_version_applies_invariant_seven() {
        let t0 = Utc.timestamp_opt(0, 0).unwrap();
        let t1 = Utc.timestamp_opt(60, 0).unwrap();
        let mut r = sample(t0);
        r.bump_version(t1);
        assert_eq!(r.version, 2);
        assert_eq!(r.parent_version, Some(1));
        assert_eq!(r.metadata.modified_at, Some(t1));
    }
}
