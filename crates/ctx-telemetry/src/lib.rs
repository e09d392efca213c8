// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine-level metrics (C9, spec §4.10).
//!
//! Per-operation latency samples are kept in a bounded ring (last N = 1000
//! per op) alongside `total`/`failed`/`fallback_used` counters. A single
//! [`MetricsCollector::snapshot`] call derives average op time (excluding
//! failures), error rate, fallback rate, the per-backend health vector, and
//! whatever per-backend size/compression/cache figures have been reported.

#![warn(missing_docs)]

use ctx_core::Service;
use ctx_health::HealthMonitor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const RING_CAPACITY: usize = 1000;

/// Per-operation counters and a bounded ring of recent latency samples.
#[derive(Debug, Default)]
struct OpMetrics {
    samples_ms: VecDeque<u64>,
    total: u64,
    failed: u64,
    fallback_used: u64,
}

impl OpMetrics {
    fn record(&mut self, duration: Duration, failed: bool, fallback_used: bool) {
        self.total += 1;
        if failed {
            self.failed += 1;
        } else {
            self.samples_ms.push_back(duration.as_millis() as u64);
            if self.samples_ms.len() > RING_CAPACITY {
                self.samples_ms.pop_front();
            }
        }
        if fallback_used {
            self.fallback_used += 1;
        }
    }

    fn summary(&self) -> OpSummary {
        let avg_op_time_ms = if self.samples_ms.is_empty() {
            0.0
        } else {
            self.samples_ms.iter().sum::<u64>() as f64 / self.samples_ms.len() as f64
        };
        let error_rate = if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        };
        let fallback_rate = if self.total == 0 {
            0.0
        } else {
            self.fallback_used as f64 / self.total as f64
        };
        OpSummary {
            total: self.total,
            failed: self.failed,
            fallback_used: self.fallback_used,
            avg_op_time_ms,
            error_rate,
            fallback_rate,
        }
    }
}

/// Derived, serializable summary of one operation's recorded samples.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpSummary {
    /// Total calls recorded for this operation.
    pub total: u64,
    /// Calls that failed (not included in `avg_op_time_ms`).
    pub failed: u64,
    /// Calls that only succeeded after falling back to a non-primary backend.
    pub fallback_used: u64,
    /// Mean latency in milliseconds across non-failed calls in the ring.
    pub avg_op_time_ms: f64,
    /// `failed / total`.
    pub error_rate: f64,
    /// `fallback_used / total`.
    pub fallback_rate: f64,
}

/// Size/shape metrics reported by a single backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackendMetrics {
    /// Serialized bytes currently stored by this backend.
    pub size_bytes: u64,
    /// Number of records currently stored.
    pub entry_count: u64,
    /// Mean `compressed / original` byte ratio, if this backend compresses.
    pub compression_ratio: Option<f64>,
    /// Cache hits, meaningful only for the Memory backend.
    pub cache_hits: u64,
    /// Cache misses, meaningful only for the Memory backend.
    pub cache_misses: u64,
}

/// A full point-in-time metrics snapshot, as returned by the engine's
/// `getMetrics()` operation (spec §4.10, §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    /// Per-operation summaries, keyed by operation name (`"store"`, `"retrieve"`, ...).
    pub ops: BTreeMap<String, OpSummary>,
    /// Per-backend size/compression/cache figures, keyed by backend name.
    pub backends: BTreeMap<String, BackendMetrics>,
    /// `true` for every backend currently healthy.
    pub backend_health: BTreeMap<String, bool>,
}

/// Thread-safe collector for engine-level operation and backend metrics.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    ops: Mutex<BTreeMap<String, OpMetrics>>,
    backends: Mutex<BTreeMap<Service, BackendMetrics>>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one completed operation's latency, success, and whether
    /// fallback was used to satisfy it.
    pub fn record_op(&self, op: &str, duration: Duration, failed: bool, fallback_used: bool) {
        let mut ops = self.ops.lock().expect("metrics lock poisoned");
        ops.entry(op.to_string())
            .or_default()
            .record(duration, failed, fallback_used);
        drop(ops);
        debug!(
            op = %op,
            duration_ms = duration.as_millis() as u64,
            failed,
            fallback_used,
            "engine_op_recorded"
        );
    }

    /// Records a Memory-backend cache hit.
    pub fn record_cache_hit(&self, service: Service) {
        let mut backends = self.backends.lock().expect("metrics lock poisoned");
        backends.entry(service).or_default().cache_hits += 1;
    }

    /// Records a Memory-backend cache miss.
    pub fn record_cache_miss(&self, service: Service) {
        let mut backends = self.backends.lock().expect("metrics lock poisoned");
        backends.entry(service).or_default().cache_misses += 1;
    }

    /// Overwrites the current size/entry-count figures for `service`,
    /// typically polled periodically from the backend itself.
    pub fn set_size(&self, service: Service, size_bytes: u64, entry_count: u64) {
        let mut backends = self.backends.lock().expect("metrics lock poisoned");
        let entry = backends.entry(service).or_default();
        entry.size_bytes = size_bytes;
        entry.entry_count = entry_count;
    }

    /// Overwrites the current mean compression ratio for `service`.
    pub fn set_compression_ratio(&self, service: Service, ratio: f64) {
        let mut backends = self.backends.lock().expect("metrics lock poisoned");
        backends.entry(service).or_default().compression_ratio = Some(ratio);
    }

    /// Produces a full snapshot combining operation summaries, per-backend
    /// figures, and the current health vector read from `monitor`.
    #[must_use]
    pub fn snapshot(&self, monitor: &HealthMonitor) -> MetricsSnapshot {
        let ops = self.ops.lock().expect("metrics lock poisoned");
        let op_summaries = ops
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.summary()))
            .collect();

        let backends = self.backends.lock().expect("metrics lock poisoned");
        let backend_metrics = backends
            .iter()
            .map(|(service, metrics)| (service.to_string(), metrics.clone()))
            .collect();

        let mut backend_health = BTreeMap::new();
        for service in Service::FALLBACK_ORDER {
            backend_health.insert(service.to_string(), monitor.is_healthy(service));
        }

        MetricsSnapshot {
            ops: op_summaries,
            backends: backend_metrics,
            backend_health,
        }
    }

    /// Clears every recorded operation and backend metric.
    pub fn clear(&self) {
        self.ops.lock().expect("metrics lock poisoned").clear();
        self.backends.lock().expect("metrics lock poisoned").clear();
    }
}
