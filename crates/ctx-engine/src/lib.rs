// SPDX-License-Identifier: MIT OR Apache-2.0
//! The public context engine facade: routing, fallback, replication, health
//! integration, metrics, and the handoff queue consumer (C6-C10, spec §4.7-
//! §4.11, §6).
//!
//! [`ContextEngine`] is the only type callers construct directly; it owns
//! the three backends behind [`ctx_backend_core::Backend`] trait objects so
//! routing and fallback treat them polymorphically (spec §9 "Polymorphism
//! over backends"), the health monitor, the metrics collector, and the
//! handoff queue.

#![warn(missing_docs)]

use chrono::Utc;
use ctx_backend_archive::ArchiveBackend;
use ctx_backend_core::{Backend, PartialUpdate, Query};
use ctx_backend_indexed::IndexedBackend;
use ctx_backend_memory::MemoryBackend;
use ctx_config::EngineConfig;
use ctx_core::{ContextRecord, ContextType, Service, StorageLocation};
use ctx_error::{CtxError, ErrorCode};
use ctx_health::HealthMonitor;
use ctx_queue::{HandoffMessage, HandoffQueue, QueueError};
use ctx_retry::RetryConfig;
use ctx_telemetry::{MetricsCollector, MetricsSnapshot};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SIZE_ROUTE_THRESHOLD_BYTES: usize = 50_000;
const HIGH_PRIORITY_THRESHOLD: u8 = 8;

/// A dynamic routing rule: `target` is selected for the first `condition`
/// that matches, evaluated highest-`priority` first (spec §4.7).
///
/// The boxed predicate follows the same filtered-subscription pattern used
/// elsewhere in this workspace for event gating (a
/// `Box<dyn Fn(&Event) -> bool + Send + Sync>` closure), applied here to
/// records instead of events.
pub struct Route {
    /// Higher values are evaluated first; ties keep insertion order.
    pub priority: i32,
    /// Backend selected when `condition` matches.
    pub target: Service,
    /// Predicate deciding whether this route applies to a given record.
    pub condition: Box<dyn Fn(&ContextRecord) -> bool + Send + Sync>,
}

impl Route {
    /// Builds a route from a priority, target, and condition closure.
    pub fn new(
        priority: i32,
        target: Service,
        condition: impl Fn(&ContextRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            priority,
            target,
            condition: Box::new(condition),
        }
    }
}

/// The default route table installed at construction (spec §4.7 table):
/// high-priority conversations and conversational records land hot in
/// Memory, oversized or archived records land in Archive, and everything
/// else falls through to `default_storage_service`.
fn default_routes(default_storage_service: Service) -> Vec<Route> {
    let mut routes = vec![
        Route::new(100, Service::Memory, |record| {
            record.metadata.priority >= HIGH_PRIORITY_THRESHOLD
        }),
        Route::new(90, Service::Memory, |record| {
            record.kind == ContextType::Conversation
        }),
        Route::new(80, Service::Archive, |record| {
            record.metadata.archived
                || ctx_core::canonical_json(record)
                    .map(|s| s.len() > SIZE_ROUTE_THRESHOLD_BYTES)
                    .unwrap_or(false)
        }),
        Route::new(0, default_storage_service, |_| true),
    ];
    routes.sort_by(|a, b| b.priority.cmp(&a.priority));
    routes
}

/// Payload shape for a `"retrieve"` or `"delete"` handoff message.
#[derive(Debug, Deserialize)]
struct IdPayload {
    id: String,
}

/// Payload shape for an `"update"` handoff message.
#[derive(Debug, Deserialize)]
struct UpdatePayload {
    id: String,
    patch: PartialUpdate,
}

/// Orchestrates the Memory (C3), Indexed (C4), and Archive (C5) backends
/// behind a single routing/fallback/replication/health/metrics facade.
///
/// Cheaply cloneable: every field is an `Arc`, a lock-guarded collection, or
/// a cloneable handle, so [`ContextEngine::spawn_consumer`] can own an
/// `Arc<ContextEngine>` without a separate handle type.
pub struct ContextEngine {
    backends: HashMap<Service, Arc<dyn Backend + Send + Sync>>,
    archive: Arc<ArchiveBackend>,
    routes: Mutex<Vec<Route>>,
    health: Arc<AsyncMutex<HealthMonitor>>,
    metrics: Arc<MetricsCollector>,
    config: EngineConfig,
    queue: HandoffQueue,
    health_handles: Mutex<Vec<JoinHandle<()>>>,
    consumer_handle: Mutex<Option<tokio::task::AbortHandle>>,
}

impl ContextEngine {
    /// Constructs the three backends from `config` and wires up routing,
    /// health monitoring, metrics, and the handoff queue. Does not yet touch
    /// the filesystem or spawn background tasks; call [`ContextEngine::initialize`]
    /// for that.
    ///
    /// # Errors
    /// Returns [`ErrorCode::EngineInitFailed`] if the indexed backend's
    /// SQLite connection cannot be opened.
    pub async fn new(config: EngineConfig) -> Result<Self, CtxError> {
        let memory = Arc::new(MemoryBackend::new(
            config.memory.max_size,
            config.memory.eviction_policy.clone(),
            config.memory.default_ttl,
        ));

        let indexed = Arc::new(
            IndexedBackend::open(
                &config.sqlite.database_path,
                config.sqlite.full_text_search_enabled,
            )
            .await
            .map_err(|e| {
                CtxError::new(ErrorCode::EngineInitFailed, "failed to open indexed backend")
                    .with_source(e)
            })?,
        );

        let archive = Arc::new(ArchiveBackend::new(
            config.filesystem.base_path.clone(),
            config.filesystem.default_algorithm.clone(),
        ));

        let mut backends: HashMap<Service, Arc<dyn Backend + Send + Sync>> = HashMap::new();
        backends.insert(Service::Memory, memory);
        backends.insert(Service::Indexed, indexed);
        backends.insert(Service::Archive, Arc::clone(&archive) as Arc<dyn Backend + Send + Sync>);

        let routes = default_routes(config.default_storage_service);
        let health = HealthMonitor::new_all_healthy(&Service::FALLBACK_ORDER);

        Ok(Self {
            backends,
            archive,
            routes: Mutex::new(routes),
            health: Arc::new(AsyncMutex::new(health)),
            metrics: Arc::new(MetricsCollector::new()),
            config,
            queue: HandoffQueue::new(None, None),
            health_handles: Mutex::new(Vec::new()),
            consumer_handle: Mutex::new(None),
        })
    }

    /// Prepares the archive directory tree and, if enabled, starts the
    /// periodic health-probe loop for all three backends.
    ///
    /// # Errors
    /// Returns [`ErrorCode::EngineInitFailed`] if the archive directories
    /// cannot be created.
    pub async fn initialize(&self) -> Result<(), CtxError> {
        self.archive.ensure_dirs().await.map_err(|e| {
            CtxError::new(ErrorCode::EngineInitFailed, "failed to prepare archive directories")
                .with_source(e)
        })?;

        if self.config.health_check_enabled {
            let backends: Vec<(Service, Arc<dyn Backend + Send + Sync>)> = Service::FALLBACK_ORDER
                .iter()
                .filter_map(|&service| self.backends.get(&service).map(|b| (service, Arc::clone(b))))
                .collect();
            let handles = ctx_health::spawn_health_loop(
                Arc::clone(&self.health),
                backends,
                Duration::from_millis(self.config.health_check_interval_ms),
                RetryConfig::default(),
            );
            *self.health_handles.lock().expect("health handles lock poisoned") = handles;
        }

        info!(target: "ctx.engine", "context engine initialized");
        Ok(())
    }

    async fn is_healthy(&self, service: Service) -> bool {
        self.health.lock().await.is_healthy(service)
    }

    fn select_route(&self, record: &ContextRecord) -> Service {
        let routes = self.routes.lock().expect("routes lock poisoned");
        routes
            .iter()
            .find(|route| (route.condition)(record))
            .map(|route| route.target)
            .unwrap_or(self.config.default_storage_service)
    }

    async fn try_store(&self, service: Service, record: &ContextRecord) -> Result<StorageLocation, CtxError> {
        let backend = self.backends.get(&service).ok_or_else(|| {
            CtxError::new(ErrorCode::EngineNoFallbackServices, "backend not configured")
        })?;
        backend.store(record).await
    }

    /// Validates, routes, and stores `record`, falling back through
    /// `Service::FALLBACK_ORDER` on failure (spec §4.7) and, if enabled,
    /// replicating the stored record to the other healthy backends
    /// fire-and-forget (spec §4.8).
    ///
    /// # Errors
    /// Returns [`ErrorCode::ValidationInvariantViolation`] if `record` fails
    /// validation, or [`ErrorCode::EngineAllBackendsFailed`] if every
    /// eligible backend rejected the write.
    pub async fn store(
        &self,
        record: ContextRecord,
        preferred: Option<Service>,
    ) -> Result<StorageLocation, CtxError> {
        let start = Instant::now();

        if let Err(errors) = ctx_validate::validate(&record) {
            self.metrics.record_op("store", start.elapsed(), true, false);
            let first = errors.first().map(ToString::to_string).unwrap_or_default();
            return Err(
                CtxError::new(ErrorCode::ValidationInvariantViolation, "record failed validation")
                    .with_context("first_issue", first),
            );
        }

        let primary = preferred.unwrap_or_else(|| self.select_route(&record));
        let mut attempted = vec![primary];
        let mut fallback_used = false;
        let mut result = if self.is_healthy(primary).await {
            self.try_store(primary, &record).await
        } else {
            Err(CtxError::new(
                ErrorCode::BackendUnavailableTransport,
                "primary backend is currently unhealthy",
            ))
        };

        if result.is_err() && self.config.fallback_enabled {
            for service in Service::FALLBACK_ORDER {
                if attempted.contains(&service) {
                    continue;
                }
                if !self.is_healthy(service).await {
                    continue;
                }
                attempted.push(service);
                fallback_used = true;
                result = self.try_store(service, &record).await;
                if result.is_ok() {
                    break;
                }
            }
        }

        match result {
            Ok(location) => {
                self.metrics.record_op("store", start.elapsed(), false, fallback_used);
                if self.config.replication_enabled {
                    self.replicate(location.service, record);
                }
                Ok(location)
            }
            Err(e) => {
                self.metrics.record_op("store", start.elapsed(), true, fallback_used);
                warn!(target: "ctx.engine", error = %e, "all eligible backends rejected the write");
                Err(CtxError::new(
                    ErrorCode::EngineAllBackendsFailed,
                    "no backend accepted the record",
                )
                .with_source(e))
            }
        }
    }

    /// Spawns a fire-and-forget fan-out of `record` to every healthy backend
    /// other than `primary`. Failures are logged, never propagated (spec §4.8:
    /// replication is best-effort and unordered).
    fn replicate(&self, primary: Service, record: ContextRecord) {
        let backends = self.backends.clone();
        let health = Arc::clone(&self.health);
        tokio::spawn(async move {
            for service in Service::FALLBACK_ORDER {
                if service == primary {
                    continue;
                }
                if !health.lock().await.is_healthy(service) {
                    continue;
                }
                if let Some(backend) = backends.get(&service) {
                    if let Err(e) = backend.store(&record).await {
                        warn!(target: "ctx.engine", %service, error = %e, "replication failed");
                    }
                }
            }
        });
    }

    /// Retrieves a record by id, trying `Memory → Indexed → Archive` and
    /// returning the first hit. A hit on a non-Memory backend triggers a
    /// fire-and-forget cache population into Memory (spec §4.7 "async cache
    /// population").
    ///
    /// # Errors
    /// Returns [`ErrorCode::NotFoundRecord`] if no backend holds `id`.
    pub async fn retrieve(&self, id: &str) -> Result<ContextRecord, CtxError> {
        let start = Instant::now();

        for service in Service::FALLBACK_ORDER {
            let Some(backend) = self.backends.get(&service) else {
                continue;
            };
            match backend.retrieve(id).await {
                Ok(Some(record)) => {
                    let fallback_used = service != Service::Memory;
                    self.metrics.record_op("retrieve", start.elapsed(), false, fallback_used);
                    if service == Service::Memory {
                        self.metrics.record_cache_hit(Service::Memory);
                    } else {
                        self.metrics.record_cache_miss(Service::Memory);
                        self.populate_cache(record.clone());
                    }
                    return Ok(record);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(target: "ctx.engine", %service, error = %e, "retrieve probe failed");
                    continue;
                }
            }
        }

        self.metrics.record_op("retrieve", start.elapsed(), true, false);
        Err(CtxError::new(ErrorCode::NotFoundRecord, "no backend holds this record"))
    }

    /// Fire-and-forget best-effort write of `record` into the Memory backend,
    /// used to warm the hot cache after a non-Memory retrieve hit.
    fn populate_cache(&self, record: ContextRecord) {
        let Some(memory) = self.backends.get(&Service::Memory).cloned() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = memory.store(&record).await {
                warn!(target: "ctx.engine", error = %e, "cache population failed");
            }
        });
    }

    /// Executes `query`, preferring the Indexed backend; falls back to the
    /// Memory backend for simple (non-full-text, non-relationship) queries
    /// when Indexed is unavailable or unhealthy. Never queries Archive (spec
    /// §4.7: the archive backend is not a query target).
    ///
    /// # Errors
    /// Returns [`ErrorCode::EngineAllBackendsFailed`] if no eligible backend
    /// could satisfy `query`.
    pub async fn query(&self, query: &Query) -> Result<Vec<ContextRecord>, CtxError> {
        let start = Instant::now();

        if self.is_healthy(Service::Indexed).await {
            if let Some(backend) = self.backends.get(&Service::Indexed) {
                match backend.query(query).await {
                    Ok(records) => {
                        self.metrics.record_op("query", start.elapsed(), false, false);
                        return Ok(records);
                    }
                    Err(e) => {
                        warn!(target: "ctx.engine", error = %e, "indexed query failed, considering fallback");
                    }
                }
            }
        }

        if query.is_simple() {
            if let Some(backend) = self.backends.get(&Service::Memory) {
                match backend.query(query).await {
                    Ok(records) => {
                        self.metrics.record_op("query", start.elapsed(), false, true);
                        return Ok(records);
                    }
                    Err(e) => {
                        warn!(target: "ctx.engine", error = %e, "memory fallback query failed");
                    }
                }
            }
        }

        self.metrics.record_op("query", start.elapsed(), true, false);
        Err(CtxError::new(
            ErrorCode::EngineAllBackendsFailed,
            "no backend could satisfy the query",
        ))
    }

    /// Applies `partial` to the record at `id` on every healthy backend that
    /// holds it, per spec §4.5's read-merge-validate-write cycle; succeeds
    /// if at least one backend confirms the update.
    ///
    /// # Errors
    /// Returns [`ErrorCode::NotFoundRecord`] if no backend holds `id`, or the
    /// last backend error if every attempt failed outright.
    pub async fn update(&self, id: &str, partial: &PartialUpdate) -> Result<(), CtxError> {
        let start = Instant::now();
        let mut any_found = false;
        let mut last_err = None;

        for service in Service::FALLBACK_ORDER {
            let Some(backend) = self.backends.get(&service) else {
                continue;
            };
            if !self.is_healthy(service).await {
                continue;
            }
            match backend.update(id, partial).await {
                Ok(true) => any_found = true,
                Ok(false) => {}
                Err(e) => last_err = Some(e),
            }
        }

        if any_found {
            self.metrics.record_op("update", start.elapsed(), false, false);
            Ok(())
        } else {
            self.metrics.record_op("update", start.elapsed(), true, false);
            Err(last_err.unwrap_or_else(|| {
                CtxError::new(ErrorCode::NotFoundRecord, "no backend holds this record")
            }))
        }
    }

    /// Deletes the record at `id` from every healthy backend. Absence on any
    /// given backend is not an error (spec §4.3 delete is idempotent), so
    /// this always reports success.
    pub async fn delete(&self, id: &str) -> Result<(), CtxError> {
        let start = Instant::now();
        for service in Service::FALLBACK_ORDER {
            let Some(backend) = self.backends.get(&service) else {
                continue;
            };
            if !self.is_healthy(service).await {
                continue;
            }
            if let Err(e) = backend.delete(id).await {
                warn!(target: "ctx.engine", %service, error = %e, "delete failed on backend");
            }
        }
        self.metrics.record_op("delete", start.elapsed(), false, false);
        Ok(())
    }

    /// Installs a new routing rule, re-sorting the route table by descending
    /// priority so it takes effect on the next `store`.
    pub fn add_route(&self, route: Route) {
        let mut routes = self.routes.lock().expect("routes lock poisoned");
        routes.push(route);
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// A point-in-time snapshot of operation and backend metrics, joined with
    /// the current health vector (spec §4.10, §6 `getMetrics()`).
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let health = self.health.lock().await;
        self.metrics.snapshot(&health)
    }

    /// Enqueues `message` onto the handoff queue for asynchronous dispatch by
    /// the consumer started with [`ContextEngine::spawn_consumer`].
    ///
    /// # Errors
    /// Returns a [`QueueError`] per the queue's state machine (spec §4.11).
    pub fn enqueue(&self, message: HandoffMessage) -> Result<(), QueueError> {
        self.queue.enqueue(message)
    }

    /// Starts the queue's single consumer, dispatching each drained
    /// [`HandoffMessage`] to the matching engine operation by its `kind`
    /// field. Each message is handled on its own spawned task so a slow
    /// operation cannot head-of-line block the queue (spec §4.11 C10).
    ///
    /// # Errors
    /// Returns [`QueueError::AlreadyConsumed`] if a consumer was already
    /// started.
    pub fn spawn_consumer(self: &Arc<Self>) -> Result<JoinHandle<()>, QueueError> {
        let mut consumer = self.queue.consume()?;
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(message) = consumer.next().await {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.dispatch(message).await;
                });
            }
        });
        *self.consumer_handle.lock().expect("consumer handle lock poisoned") = Some(handle.abort_handle());
        Ok(handle)
    }

    async fn dispatch(&self, message: HandoffMessage) {
        let outcome: Result<(), CtxError> = match message.kind.as_str() {
            "store" => match serde_json::from_value::<ContextRecord>(message.content.clone()) {
                Ok(record) => self.store(record, None).await.map(|_| ()),
                Err(e) => Err(malformed_payload(e)),
            },
            "retrieve" => match serde_json::from_value::<IdPayload>(message.content.clone()) {
                Ok(payload) => self.retrieve(&payload.id).await.map(|_| ()),
                Err(e) => Err(malformed_payload(e)),
            },
            "update" => match serde_json::from_value::<UpdatePayload>(message.content.clone()) {
                Ok(payload) => self.update(&payload.id, &payload.patch).await,
                Err(e) => Err(malformed_payload(e)),
            },
            "delete" => match serde_json::from_value::<IdPayload>(message.content.clone()) {
                Ok(payload) => self.delete(&payload.id).await,
                Err(e) => Err(malformed_payload(e)),
            },
            other => Err(CtxError::new(
                ErrorCode::ValidationInvariantViolation,
                format!("unknown handoff message kind `{other}`"),
            )),
        };

        if let Err(e) = outcome {
            warn!(
                target: "ctx.engine",
                message_id = %message.id,
                kind = %message.kind,
                error = %e,
                "handoff message dispatch failed"
            );
        }
    }

    /// Tears the engine down in the fixed order Archive → Indexed → Memory →
    /// Queue (spec §5 "Shared resources"): aborts the health-probe loop and
    /// queue consumer, calls [`Backend::shutdown`] on each backend, then
    /// destroys the handoff queue.
    ///
    /// # Errors
    /// Returns [`ErrorCode::EngineShutdownFailed`] if a backend's shutdown
    /// fails.
    pub async fn shutdown(&self) -> Result<(), CtxError> {
        for handle in self.health_handles.lock().expect("health handles lock poisoned").drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.consumer_handle.lock().expect("consumer handle lock poisoned").take() {
            handle.abort();
        }

        for service in [Service::Archive, Service::Indexed, Service::Memory] {
            if let Some(backend) = self.backends.get(&service) {
                backend.shutdown().await.map_err(|e| {
                    CtxError::new(ErrorCode::EngineShutdownFailed, "backend shutdown failed")
                        .with_source(e)
                })?;
            }
        }

        self.queue.destroy().await;
        info!(target: "ctx.engine", "context engine shut down");
        Ok(())
    }
}

fn malformed_payload(e: serde_json::Error) -> CtxError {
    CtxError::new(ErrorCode::ValidationInvariantViolation, "malformed handoff message payload")
        .with_source(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use ctx_core::{ContextContent, ContextMetadata, ConversationContent, ConversationTurn};
    use ctx_queue::Priority;

    fn conversation_record(id: &str, priority: u8) -> ContextRecord {
        let now = Utc::now();
        let content = ContextContent::Conversation(ConversationContent {
            turns: vec![ConversationTurn {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
        });
        let checksum = ctx_core::content_checksum(&content).expect("checksum");
        ContextRecord {
            id: id.to_string(),
            kind: ContextType::Conversation,
            schema_version: ctx_core::CURRENT_SCHEMA_VERSION,
            content,
            metadata: ContextMetadata::new(now, priority, None),
            relationships: Vec::new(),
            version: 1,
            parent_version: None,
            checksum,
        }
    }

    async fn test_engine() -> ContextEngine {
        let mut config = EngineConfig::default();
        config.sqlite.database_path = ":memory:".to_string();
        config.filesystem.base_path = std::env::temp_dir()
            .join(format!("ctx-engine-test-{}", uuid::Uuid::new_v4()))
            .display()
            .to_string();
        let engine = ContextEngine::new(config).await.expect("engine constructs");
        engine.initialize().await.expect("engine initializes");
        engine
    }

    #[tokio::test]
    async fn hot_conversation_routes_to_memory_and_bumps_access_count() {
        let engine = test_engine().await;
        let record = conversation_record("c1", 9);
        let location = engine.store(record, None).await.expect("store succeeds");
        assert_eq!(location.service, Service::Memory);

        let fetched = engine.retrieve("c1").await.expect("retrieve succeeds");
        assert_eq!(fetched.metadata.access_count, 1);
    }

    #[tokio::test]
    async fn fallback_engages_when_primary_unhealthy() {
        let engine = test_engine().await;
        engine
            .health
            .lock()
            .await
            .record_check(
                Service::Memory,
                ctx_health::HealthStatus::Unhealthy {
                    reason: "forced down for test".to_string(),
                },
                Duration::from_millis(1),
            );

        let record = conversation_record("c2", 9);
        let location = engine.store(record, None).await.expect("fallback succeeds");
        assert_ne!(location.service, Service::Memory);

        let snapshot = engine.get_metrics().await;
        assert!(snapshot.ops["store"].fallback_rate > 0.0);
    }

    #[tokio::test]
    async fn retrieve_reports_not_found_for_unknown_id() {
        let engine = test_engine().await;
        let err = engine.retrieve("missing").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFoundRecord);
    }

    #[tokio::test]
    async fn update_bumps_version_and_sets_parent() {
        let engine = test_engine().await;
        let record = conversation_record("c3", 5);
        engine.store(record, Some(Service::Memory)).await.expect("store succeeds");

        let patch = PartialUpdate {
            priority: Some(7),
            ..PartialUpdate::default()
        };
        engine.update("c3", &patch).await.expect("update succeeds");

        let fetched = engine.retrieve("c3").await.expect("retrieve succeeds");
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.parent_version, Some(1));
        assert_eq!(fetched.metadata.priority, 7);
        let modified_at = fetched.metadata.modified_at.expect("update stamps modified_at");
        assert!(modified_at - fetched.metadata.created_at >= ChronoDuration::zero());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let engine = test_engine().await;
        let record = conversation_record("c4", 3);
        engine.store(record, Some(Service::Memory)).await.expect("store succeeds");
        engine.delete("c4").await.expect("first delete succeeds");
        engine.delete("c4").await.expect("second delete is still a success");
        assert!(engine.retrieve("c4").await.is_err());
    }

    #[tokio::test]
    async fn add_route_is_consulted_before_defaults() {
        let engine = test_engine().await;
        engine.add_route(Route::new(200, Service::Archive, |record| record.id == "forced"));

        let record = conversation_record("forced", 9);
        let location = engine.store(record, None).await.expect("store succeeds");
        assert_eq!(location.service, Service::Archive);
    }

    #[tokio::test]
    async fn query_prefers_indexed_when_healthy() {
        let engine = test_engine().await;
        engine
            .store(conversation_record("q1", 5), Some(Service::Indexed))
            .await
            .expect("store succeeds");

        let query = Query {
            full_text: None,
            ..Query::new()
        };
        let results = engine.query(&query).await.expect("query succeeds");
        assert!(results.iter().any(|r| r.id == "q1"));
    }

    #[tokio::test]
    async fn query_falls_back_to_memory_for_simple_queries_when_indexed_down() {
        let engine = test_engine().await;
        engine
            .store(conversation_record("q2", 5), Some(Service::Memory))
            .await
            .expect("store succeeds");
        engine
            .health
            .lock()
            .await
            .record_check(
                Service::Indexed,
                ctx_health::HealthStatus::Unhealthy {
                    reason: "forced down for test".to_string(),
                },
                Duration::from_millis(1),
            );

        let results = engine.query(&Query::new()).await.expect("fallback query succeeds");
        assert!(results.iter().any(|r| r.id == "q2"));

        let snapshot = engine.get_metrics().await;
        assert!(snapshot.ops["query"].fallback_rate > 0.0);
    }

    #[tokio::test]
    async fn query_fails_when_indexed_down_and_query_is_not_simple() {
        let engine = test_engine().await;
        engine
            .health
            .lock()
            .await
            .record_check(
                Service::Indexed,
                ctx_health::HealthStatus::Unhealthy {
                    reason: "forced down for test".to_string(),
                },
                Duration::from_millis(1),
            );

        let query = Query {
            full_text: Some("hello".to_string()),
            ..Query::new()
        };
        let err = engine.query(&query).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::EngineAllBackendsFailed);
    }

    #[tokio::test]
    async fn queue_drains_in_priority_order() {
        let queue = HandoffQueue::new(None, None);
        for (id, priority) in [
            ("low", Priority::Low),
            ("critical", Priority::Critical),
            ("normal", Priority::Normal),
            ("high", Priority::High),
        ] {
            queue
                .enqueue(HandoffMessage {
                    id: id.to_string(),
                    kind: "noop".to_string(),
                    content: serde_json::json!({}),
                    priority,
                    timestamp: Utc::now(),
                })
                .expect("enqueue succeeds");
        }
        queue.done().expect("done succeeds");

        let mut consumer = queue.consume().expect("consume succeeds");
        let order: Vec<String> = (&mut consumer).map(|m| m.id).collect().await;
        assert_eq!(order, vec!["critical", "high", "normal", "low"]);
    }
}
