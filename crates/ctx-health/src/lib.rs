// SPDX-License-Identifier: MIT OR Apache-2.0
//! Health monitor for the three storage backends (C8, spec §4.9).
//!
//! At construction every backend is flagged healthy. A periodic task probes
//! each backend's side-effect-free [`ctx_backend_core::Backend::health_check`]
//! and records a state transition when the flag flips; routing and fallback
//! consult [`HealthMonitor::is_healthy`] without waiting on in-flight probes.

#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use ctx_backend_core::Backend;
use ctx_core::Service;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Health status of a single backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    /// The backend answered its probe successfully.
    Healthy,
    /// The backend answered but is not at full capacity. Not currently
    /// produced by the boolean [`Backend::health_check`] probe; kept for
    /// forward compatibility with richer backend-reported health.
    Degraded {
        /// Description of the degradation.
        reason: String,
    },
    /// The backend's probe failed.
    Unhealthy {
        /// Description of the failure.
        reason: String,
    },
    /// No probe has completed yet.
    Unknown,
}

impl HealthStatus {
    /// `true` only for [`HealthStatus::Healthy`].
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Result of the most recent probe for one backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Which backend this check describes.
    pub service: Service,
    /// Current health status.
    pub status: HealthStatus,
    /// When this check was last performed.
    pub last_checked: DateTime<Utc>,
    /// How long the probe took.
    #[serde(with = "duration_millis")]
    pub response_time: Duration,
    /// Number of consecutive failed probes.
    pub consecutive_failures: u32,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Aggregated point-in-time snapshot of all monitored backends.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    /// Rolled-up status across all backends.
    pub overall: HealthStatus,
    /// Individual check results, one per monitored backend.
    pub checks: Vec<HealthCheck>,
    /// When this report was generated.
    pub generated_at: DateTime<Utc>,
}

/// Tracks health state and rolling uptime history for every configured backend.
///
/// Extends spec §4.9's boolean health flag with consecutive-failure counts
/// and an uptime percentage (kept as an additional view, not a replacement:
/// [`HealthMonitor::is_healthy`] is still the single boolean routing reads).
#[derive(Debug)]
pub struct HealthMonitor {
    checks: BTreeMap<Service, HealthCheck>,
    history: BTreeMap<Service, Vec<bool>>,
}

const HISTORY_CAP: usize = 1000;

impl HealthMonitor {
    /// Creates a monitor with every given service flagged healthy, per spec
    /// §4.9 "at construction, all backends are flagged healthy".
    #[must_use]
    pub fn new_all_healthy(services: &[Service]) -> Self {
        let now = Utc::now();
        let mut checks = BTreeMap::new();
        let mut history = BTreeMap::new();
        for &service in services {
            checks.insert(
                service,
                HealthCheck {
                    service,
                    status: HealthStatus::Healthy,
                    last_checked: now,
                    response_time: Duration::ZERO,
                    consecutive_failures: 0,
                },
            );
            history.insert(service, vec![true]);
        }
        Self { checks, history }
    }

    /// Records the outcome of a probe for `service`, logging a transition if
    /// the health flag flipped.
    pub fn record_check(&mut self, service: Service, status: HealthStatus, response_time: Duration) {
        let is_healthy = status.is_healthy();
        let was_healthy = self.is_healthy(service);

        let consecutive_failures = if is_healthy {
            0
        } else {
            self.checks
                .get(&service)
                .map_or(1, |prev| prev.consecutive_failures + 1)
        };

        if was_healthy != is_healthy {
            if is_healthy {
                info!(target: "ctx.health", %service, "backend recovered, now healthy");
            } else {
                warn!(target: "ctx.health", %service, status = ?status, "backend transitioned to unhealthy");
            }
        }

        self.checks.insert(
            service,
            HealthCheck {
                service,
                status,
                last_checked: Utc::now(),
                response_time,
                consecutive_failures,
            },
        );

        let history = self.history.entry(service).or_default();
        history.push(is_healthy);
        if history.len() > HISTORY_CAP {
            let excess = history.len() - HISTORY_CAP;
            history.drain(0..excess);
        }
    }

    /// `true` if `service` is currently healthy. Services never probed
    /// default to healthy, per spec §4.9's construction-time invariant.
    #[must_use]
    pub fn is_healthy(&self, service: Service) -> bool {
        self.checks
            .get(&service)
            .map_or(true, |c| c.status.is_healthy())
    }

    /// Latest check result for `service`, if any probe has run.
    #[must_use]
    pub fn get_status(&self, service: Service) -> Option<&HealthCheck> {
        self.checks.get(&service)
    }

    /// `true` if every tracked backend is currently healthy.
    #[must_use]
    pub fn all_healthy(&self) -> bool {
        !self.checks.is_empty() && self.checks.values().all(|c| c.status.is_healthy())
    }

    /// Services currently flagged unhealthy.
    #[must_use]
    pub fn unhealthy_services(&self) -> Vec<Service> {
        self.checks
            .values()
            .filter(|c| !c.status.is_healthy())
            .map(|c| c.service)
            .collect()
    }

    /// Percentage of historical probes that were healthy (0.0-100.0), over
    /// up to the last 1000 samples. `0.0` if `service` has never been probed.
    #[must_use]
    pub fn uptime_percentage(&self, service: Service) -> f64 {
        match self.history.get(&service) {
            Some(h) if !h.is_empty() => {
                let healthy = h.iter().filter(|&&ok| ok).count();
                (healthy as f64 / h.len() as f64) * 100.0
            }
            _ => 0.0,
        }
    }

    /// Generates a point-in-time report across all monitored backends.
    #[must_use]
    pub fn generate_report(&self) -> HealthReport {
        let checks: Vec<HealthCheck> = self.checks.values().cloned().collect();
        let overall = Self::compute_overall(&checks);
        HealthReport {
            overall,
            checks,
            generated_at: Utc::now(),
        }
    }

    fn compute_overall(checks: &[HealthCheck]) -> HealthStatus {
        if checks.is_empty() {
            return HealthStatus::Unknown;
        }
        if checks
            .iter()
            .any(|c| matches!(c.status, HealthStatus::Unhealthy { .. }))
        {
            return HealthStatus::Unhealthy {
                reason: "one or more backends unhealthy".into(),
            };
        }
        if checks
            .iter()
            .any(|c| matches!(c.status, HealthStatus::Degraded { .. }))
        {
            return HealthStatus::Degraded {
                reason: "one or more backends degraded".into(),
            };
        }
        HealthStatus::Healthy
    }
}

/// Probes `backend` once and records the result into `monitor`.
pub async fn probe_once(
    monitor: &Mutex<HealthMonitor>,
    service: Service,
    backend: &(dyn Backend + Send + Sync),
) {
    let start = std::time::Instant::now();
    let healthy = backend.health_check().await;
    let elapsed = start.elapsed();
    let status = if healthy {
        HealthStatus::Healthy
    } else {
        HealthStatus::Unhealthy {
            reason: "health_check returned false".to_string(),
        }
    };
    monitor.lock().await.record_check(service, status, elapsed);
}

/// Spawns one cooperative task per backend that probes it on `interval`,
/// re-probing sooner with exponential backoff (capped at `interval`) while
/// the backend remains unhealthy (spec-supplemental: `ctx_retry` governs
/// only this re-probe cadence, never the synchronous fallback path).
///
/// Returns the join handles so callers can `abort()` them during the
/// engine's shutdown sequence.
pub fn spawn_health_loop(
    monitor: Arc<Mutex<HealthMonitor>>,
    backends: Vec<(Service, Arc<dyn Backend + Send + Sync>)>,
    interval: Duration,
    retry_config: ctx_retry::RetryConfig,
) -> Vec<JoinHandle<()>> {
    backends
        .into_iter()
        .map(|(service, backend)| {
            let monitor = Arc::clone(&monitor);
            let retry_config = retry_config.clone();
            tokio::spawn(async move {
                loop {
                    probe_once(&monitor, service, backend.as_ref()).await;

                    let healthy = monitor.lock().await.is_healthy(service);
                    if healthy {
                        tokio::time::sleep(interval).await;
                        continue;
                    }

                    let failures = monitor
                        .lock()
                        .await
                        .get_status(service)
                        .map_or(0, |c| c.consecutive_failures);
                    let backoff = ctx_retry::compute_delay(&retry_config, failures.min(31));
                    tokio::time::sleep(backoff.min(interval)).await;
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ctx_backend_core::{BackendIdentity, PartialUpdate, Query, QueryCapability};
    use ctx_core::{ContextRecord, StorageLocation};
    use ctx_error::CtxError;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyBackend {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        fn identity(&self) -> BackendIdentity {
            BackendIdentity {
                service: Service::Memory,
            }
        }
        fn query_capability(&self) -> QueryCapability {
            QueryCapability::Simple
        }
        async fn store(&self, _: &ContextRecord) -> Result<StorageLocation, CtxError> {
            unimplemented!()
        }
        async fn retrieve(&self, _: &str) -> Result<Option<ContextRecord>, CtxError> {
            unimplemented!()
        }
        async fn update(&self, _: &str, _: &PartialUpdate) -> Result<bool, CtxError> {
            unimplemented!()
        }
        async fn delete(&self, _: &str) -> Result<(), CtxError> {
            unimplemented!()
        }
        async fn query(&self, _: &Query) -> Result<Vec<ContextRecord>, CtxError> {
            unimplemented!()
        }
        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn all_services_start_healthy() {
        let monitor = HealthMonitor::new_all_healthy(&[Service::Memory, Service::Indexed]);
        assert!(monitor.is_healthy(Service::Memory));
        assert!(monitor.is_healthy(Service::Indexed));
        assert!(monitor.all_healthy());
    }

    #[test]
    fn unprobed_service_defaults_to_healthy() {
        let monitor = HealthMonitor::new_all_healthy(&[]);
        assert!(monitor.is_healthy(Service::Archive));
    }

    #[test]
    fn record_check_tracks_consecutive_failures() {
        let mut monitor = HealthMonitor::new_all_healthy(&[Service::Memory]);
        monitor.record_check(
            Service::Memory,
            HealthStatus::Unhealthy {
                reason: "timeout".into(),
            },
            Duration::from_millis(5),
        );
        monitor.record_check(
            Service::Memory,
            HealthStatus::Unhealthy {
                reason: "timeout".into(),
            },
            Duration::from_millis(5),
        );
        let check = monitor.get_status(Service::Memory).unwrap();
        assert_eq!(check.consecutive_failures, 2);
        assert!(!monitor.is_healthy(Service::Memory));
        assert_eq!(monitor.unhealthy_services(), vec![Service::Memory]);
    }

    #[test]
    fn recovery_resets_consecutive_failures() {
        let mut monitor = HealthMonitor::new_all_healthy(&[Service::Memory]);
        monitor.record_check(
            Service::Memory,
            HealthStatus::Unhealthy {
                reason: "x".into(),
            },
            Duration::from_millis(1),
        );
        monitor.record_check(Service::Memory, HealthStatus::Healthy, Duration::from_millis(1));
        let check = monitor.get_status(Service::Memory).unwrap();
        assert_eq!(check.consecutive_failures, 0);
        assert!(monitor.is_healthy(Service::Memory));
    }

    #[test]
    fn uptime_percentage_reflects_history() {
        let mut monitor = HealthMonitor::new_all_healthy(&[Service::Memory]);
        monitor.record_check(
            Service::Memory,
            HealthStatus::Unhealthy {
                reason: "x".into(),
            },
            Duration::from_millis(1),
        );
        // history: [true (construction), false] => 50%
        assert_eq!(monitor.uptime_percentage(Service::Memory), 50.0);
    }

    #[test]
    fn generate_report_rolls_up_worst_status() {
        let mut monitor = HealthMonitor::new_all_healthy(&[Service::Memory, Service::Indexed]);
        monitor.record_check(
            Service::Indexed,
            HealthStatus::Unhealthy {
                reason: "down".into(),
            },
            Duration::from_millis(2),
        );
        let report = monitor.generate_report();
        assert!(matches!(report.overall, HealthStatus::Unhealthy { .. }));
        assert_eq!(report.checks.len(), 2);
    }

    #[tokio::test]
    async fn probe_once_records_backend_result() {
        let monitor = Mutex::new(HealthMonitor::new_all_healthy(&[Service::Memory]));
        let backend = FlakyBackend {
            healthy: AtomicBool::new(false),
        };
        probe_once(&monitor, Service::Memory, &backend).await;
        assert!(!monitor.lock().await.is_healthy(Service::Memory));
    }
}
