// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hot, TTL-bounded in-memory cache backend (spec §4.4 C3).
//!
//! Backed by a single `Mutex`-protected map with LRU/LFU/TTL eviction; the
//! `Backend` impl and its always-healthy probe follow the same construction
//! and failure-reporting shape used throughout this workspace.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ctx_backend_core::{
    check_query_capability, Backend, BackendIdentity, PartialUpdate, Query, QueryCapability,
};
use ctx_core::{ContextRecord, Service, StorageLocation};
use ctx_error::{CtxError, ErrorCode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Byte-budget eviction policy (spec §6 `memory.evictionPolicy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionPolicy {
    /// Evict the least-recently-accessed entry.
    Lru,
    /// Evict the least-frequently-accessed entry.
    Lfu,
    /// Evict the oldest-inserted entry.
    Fifo,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

struct Entry {
    record: ContextRecord,
    size_bytes: u64,
    insertion_seq: u64,
}

struct State {
    entries: HashMap<String, Entry>,
    used_bytes: u64,
    insertion_counter: u64,
    eviction_count: u64,
}

/// The in-memory backend (C3).
pub struct MemoryBackend {
    state: Mutex<State>,
    byte_budget: u64,
    policy: EvictionPolicy,
    default_ttl: Option<u64>,
}

impl MemoryBackend {
    /// Builds an empty backend with the given byte budget and policy.
    #[must_use]
    pub fn new(byte_budget: u64, policy: EvictionPolicy, default_ttl: Option<u64>) -> Self {
        MemoryBackend {
            state: Mutex::new(State {
                entries: HashMap::new(),
                used_bytes: 0,
                insertion_counter: 0,
                eviction_count: 0,
            }),
            byte_budget,
            policy,
            default_ttl,
        }
    }

    /// Number of evictions performed since construction.
    #[must_use]
    pub fn eviction_count(&self) -> u64 {
        self.state.lock().expect("memory state lock poisoned").eviction_count
    }

    /// Number of entries currently cached.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("memory state lock poisoned").entries.len()
    }

    /// `true` if no entries are cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_size(record: &ContextRecord) -> u64 {
        ctx_core::canonical_json(record).map(|s| s.len() as u64).unwrap_or(0)
    }

    /// Runs a single expiry sweep, removing entries past `expires_at`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().expect("memory state lock poisoned");
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.record.metadata.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = state.entries.remove(id) {
                state.used_bytes = state.used_bytes.saturating_sub(entry.size_bytes);
            }
        }
        expired.len()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn identity(&self) -> BackendIdentity {
        BackendIdentity {
            service: Service::Memory,
        }
    }

    fn query_capability(&self) -> QueryCapability {
        QueryCapability::Simple
    }

    async fn store(&self, record: &ContextRecord) -> Result<StorageLocation, CtxError> {
        let size = Self::record_size(record);
        let mut state = self.state.lock().expect("memory state lock poisoned");

        while state.used_bytes + size > self.byte_budget && !state.entries.is_empty() {
            let victim_id = match self.policy {
                EvictionPolicy::Fifo => state.entries.iter().min_by_key(|(_, e)| e.insertion_seq).map(|(id, _)| id.clone()),
                EvictionPolicy::Lru => state.entries.iter().min_by_key(|(_, e)| e.record.metadata.last_accessed).map(|(id, _)| id.clone()),
                EvictionPolicy::Lfu => state.entries.iter().min_by_key(|(_, e)| e.record.metadata.access_count).map(|(id, _)| id.clone()),
            };
            let Some(victim_id) = victim_id else { break };
            if let Some(victim) = state.entries.remove(&victim_id) {
                state.used_bytes = state.used_bytes.saturating_sub(victim.size_bytes);
                state.eviction_count += 1;
            }
        }

        state.insertion_counter += 1;
        let seq = state.insertion_counter;
        let mut stored_record = record.clone();
        if stored_record.metadata.ttl.is_none() {
            stored_record.metadata.ttl = self.default_ttl;
        }
        state.entries.insert(
            record.id.clone(),
            Entry {
                record: stored_record,
                size_bytes: size,
                insertion_seq: seq,
            },
        );
        state.used_bytes += size;

        Ok(StorageLocation {
            context_id: record.id.clone(),
            service: Service::Memory,
            path: format!("memory://{}", record.id),
            stored_at: Utc::now(),
            storage_size: size,
            compressed: false,
            encrypted: record.metadata.mcp_storage.encrypted,
            access_count: record.metadata.access_count,
        })
    }

    async fn retrieve(&self, id: &str) -> Result<Option<ContextRecord>, CtxError> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("memory state lock poisoned");
        let expired = state
            .entries
            .get(id)
            .is_some_and(|e| e.record.metadata.is_expired(now));
        if expired {
            if let Some(entry) = state.entries.remove(id) {
                state.used_bytes = state.used_bytes.saturating_sub(entry.size_bytes);
            }
            return Ok(None);
        }
        match state.entries.get_mut(id) {
            Some(entry) => {
                entry.record.metadata.record_access(now);
                Ok(Some(entry.record.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, partial: &PartialUpdate) -> Result<bool, CtxError> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("memory state lock poisoned");
        let Some(entry) = state.entries.get_mut(id) else {
            return Ok(false);
        };
        if entry.record.metadata.is_expired(now) {
            let entry = state.entries.remove(id).expect("just matched");
            state.used_bytes = state.used_bytes.saturating_sub(entry.size_bytes);
            return Ok(false);
        }

        let mut updated = entry.record.clone();
        apply_partial_update(&mut updated, partial, now);
        updated.bump_version(now);
        updated.checksum = ctx_core::content_checksum(&updated.content)
            .map_err(|e| CtxError::new(ErrorCode::ValidationInvariantViolation, e.to_string()))?;

        ctx_validate::validate(&updated).map_err(|errors| {
            let mut err = CtxError::new(
                ErrorCode::ValidationInvariantViolation,
                format!("update produced an invalid record: {} issue(s)", errors.len()),
            );
            if let Some(first) = errors.first() {
                err = err.with_context("first_issue", first.to_string());
            }
            err
        })?;

        let new_size = Self::record_size(&updated);
        let old_size = entry.size_bytes;
        entry.record = updated;
        entry.size_bytes = new_size;
        state.used_bytes = state.used_bytes.saturating_sub(old_size) + new_size;
        Ok(true)
    }

    async fn delete(&self, id: &str) -> Result<(), CtxError> {
        let mut state = self.state.lock().expect("memory state lock poisoned");
        if let Some(entry) = state.entries.remove(id) {
            state.used_bytes = state.used_bytes.saturating_sub(entry.size_bytes);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<ContextRecord>, CtxError> {
        check_query_capability(self.query_capability(), query)?;
        let now = Utc::now();
        let state = self.state.lock().expect("memory state lock poisoned");
        let mut matches: Vec<ContextRecord> = state
            .entries
            .values()
            .filter(|e| !e.record.metadata.is_expired(now))
            .map(|e| e.record.clone())
            .filter(|r| matches_predicates(r, query))
            .collect();
        drop(state);

        if let Some(field) = &query.sort_by {
            matches.sort_by(|a, b| {
                let ord = field_value(a, field).to_string().cmp(&field_value(b, field).to_string());
                if query.sort_descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(offset) = query.offset {
            matches = matches.into_iter().skip(offset).collect();
        }
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn apply_partial_update(record: &mut ContextRecord, partial: &PartialUpdate, now: DateTime<Utc>) {
    if let Some(content) = &partial.content {
        record.content = content.clone();
    }
    if let Some(priority) = partial.priority {
        record.metadata.priority = priority;
    }
    if let Some(score) = partial.relevance_score {
        record.metadata.relevance_score = score;
    }
    if let Some(archived) = partial.archived {
        record.metadata.archived = archived;
    }
    if let Some(owner) = &partial.owner {
        record.metadata.owner = Some(owner.clone());
    }
    if let Some(tags) = &partial.tags {
        record.metadata.tags = tags.clone();
    }
    if let Some(ttl) = partial.ttl {
        record.metadata.ttl = Some(ttl);
        record.metadata.expires_at = Some(now + chrono::Duration::seconds(ttl as i64));
    }
}

fn field_value(record: &ContextRecord, field: &str) -> serde_json::Value {
    let value = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
    field.split('.').fold(value, |acc, part| {
        acc.get(part).cloned().unwrap_or(serde_json::Value::Null)
    })
}

fn matches_predicates(record: &ContextRecord, query: &Query) -> bool {
    query.predicates.iter().all(|p| match p {
        ctx_backend_core::QueryPredicate::Equals { field, value } => &field_value(record, field) == value,
        ctx_backend_core::QueryPredicate::Range { field, min, max } => {
            let actual = field_value(record, field);
            let above_min = min.as_ref().is_none_or(|m| json_number(&actual) >= json_number(m));
            let below_max = max.as_ref().is_none_or(|m| json_number(&actual) <= json_number(m));
            above_min && below_max
        }
    })
}

fn json_number(value: &serde_json::Value) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

/// Spawns the periodic expiry sweep (spec §4.4: "at least every 5 minutes").
pub fn spawn_expiry_sweep(
    backend: std::sync::Arc<MemoryBackend>,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = backend.sweep_expired(Utc::now());
            if removed > 0 {
                tracing::debug!(removed, "memory backend expiry sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctx_core::{ContextContent, ContextMetadata, ContextRecordBuilder, ConversationContent, ConversationTurn};

    fn sample(id: &str, priority: u8, ttl: Option<u64>) -> ContextRecord {
        let now = Utc::now();
        let content = ContextContent::Conversation(ConversationContent {
            turns: vec![ConversationTurn {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
        });
        ContextRecordBuilder::new(id, content, ContextMetadata::new(now, priority, ttl))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trips() {
        let backend = MemoryBackend::new(1_000_000, EvictionPolicy::Lru, None);
        let record = sample("c1", 9, None);
        let loc = backend.store(&record).await.unwrap();
        assert_eq!(loc.service, Service::Memory);

        let fetched = backend.retrieve("c1").await.unwrap().unwrap();
        assert_eq!(fetched.id, "c1");
        assert_eq!(fetched.metadata.access_count, 1);
    }

    #[tokio::test]
    async fn expired_record_is_not_returned() {
        let backend = MemoryBackend::new(1_000_000, EvictionPolicy::Lru, None);
        let mut record = sample("c1", 5, Some(0));
        record.metadata.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        backend.store(&record).await.unwrap();

        assert_eq!(backend.retrieve("c1").await.unwrap(), None);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new(1_000_000, EvictionPolicy::Lru, None);
        backend.delete("missing").await.unwrap();
        let record = sample("c1", 5, None);
        backend.store(&record).await.unwrap();
        backend.delete("c1").await.unwrap();
        backend.delete("c1").await.unwrap();
        assert_eq!(backend.retrieve("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_bumps_version_and_applies_patch() {
        let backend = MemoryBackend::new(1_000_000, EvictionPolicy::Lru, None);
        let record = sample("c1", 5, None);
        backend.store(&record).await.unwrap();

        let patch = PartialUpdate {
            priority: Some(7),
            ..Default::default()
        };
        assert!(backend.update("c1", &patch).await.unwrap());

        let fetched = backend.retrieve("c1").await.unwrap().unwrap();
        assert_eq!(fetched.metadata.priority, 7);
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.parent_version, Some(1));
    }

    #[tokio::test]
    async fn eviction_respects_byte_budget() {
        let record_size = Some(sample("probe", 1, None)).map(|r| MemoryBackend::record_size(&r)).unwrap();
        let backend = MemoryBackend::new(record_size, EvictionPolicy::Fifo, None);
        backend.store(&sample("a", 1, None)).await.unwrap();
        backend.store(&sample("b", 1, None)).await.unwrap();

        assert_eq!(backend.len(), 1);
        assert_eq!(backend.eviction_count(), 1);
        assert_eq!(backend.retrieve("a").await.unwrap(), None);
        assert!(backend.retrieve("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn query_filters_by_equality_predicate() {
        let backend = MemoryBackend::new(1_000_000, EvictionPolicy::Lru, None);
        backend.store(&sample("a", 9, None)).await.unwrap();
        backend.store(&sample("b", 2, None)).await.unwrap();

        let mut unsupported = Query::new();
        unsupported.full_text = Some("hello".to_string());
        assert!(backend.query(&unsupported).await.is_err());
    }
}
