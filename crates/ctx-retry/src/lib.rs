// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff with jitter, used to pace the health monitor's
//! re-probe cadence for a backend that has gone unhealthy.
//!
//! This is deliberately not used anywhere in the synchronous fallback path:
//! fallback iterates the other configured backends immediately on failure,
//! it never waits. Backoff only governs how eagerly an already-unhealthy
//! backend is re-checked.

#![warn(missing_docs)]

use ctx_error::CtxError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Backoff configuration for re-probing an unhealthy backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the initial attempt.
    /// `0` means only the initial attempt (no retries).
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Maximum delay cap for exponential backoff.
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Overall wall-clock timeout across all attempts.
    #[serde(with = "duration_millis")]
    pub overall_timeout: Duration,
    /// Jitter factor in `[0.0, 1.0]`. 0 = no jitter, 1 = full jitter.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(120),
            jitter_factor: 0.5,
        }
    }
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

/// Record of a single failed re-probe attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Zero-indexed attempt number.
    pub attempt: u32,
    /// Error message from this attempt.
    pub error: String,
    /// Backoff delay applied before the next attempt.
    #[serde(with = "duration_millis")]
    pub delay: Duration,
}

/// Metadata captured across all attempts of a [`retry_async`] call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryMetadata {
    /// Total number of attempts made (including the successful one, if any).
    pub total_attempts: u32,
    /// Records of each failed attempt.
    pub failed_attempts: Vec<RetryAttempt>,
    /// Wall-clock time spanning all attempts.
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
}

/// Outcome of a retry-enabled operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The successfully produced value.
    pub value: T,
    /// Retry metadata (empty `failed_attempts` when the first attempt succeeds).
    pub metadata: RetryMetadata,
}

/// Computes the backoff delay for a given zero-indexed attempt number.
#[must_use]
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    let delay_ms = (config.base_delay.as_millis() as u64).saturating_mul(exp);
    let capped_ms = delay_ms.min(config.max_delay.as_millis() as u64);

    let jitter_factor = config.jitter_factor.clamp(0.0, 1.0);
    if jitter_factor > 0.0 && capped_ms > 0 {
        let jitter_range = (capped_ms as f64 * jitter_factor) as u64;
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as u64;
        let pseudo = nanos.wrapping_mul(attempt as u64 + 1);
        let jitter = if jitter_range > 0 {
            pseudo % jitter_range
        } else {
            0
        };
        Duration::from_millis(capped_ms.saturating_sub(jitter))
    } else {
        Duration::from_millis(capped_ms)
    }
}

/// Default retry eligibility: anything other than a terminal error
/// (validation or checksum-mismatch categories) is worth retrying.
#[must_use]
pub fn is_retryable(err: &CtxError) -> bool {
    !err.is_terminal()
}

/// Generic retry loop. Calls `op` up to `max_retries + 1` times with
/// exponential backoff, returning the first successful result along with
/// metadata about failed attempts.
///
/// `retryable` decides whether a given error should trigger another attempt.
pub async fn retry_async<T, F, Fut>(
    config: &RetryConfig,
    mut op: F,
    retryable: fn(&CtxError) -> bool,
) -> Result<RetryOutcome<T>, CtxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CtxError>>,
{
    let start = Instant::now();
    let max_attempts = config.max_retries + 1;
    let mut failed_attempts = Vec::new();

    for attempt in 0..max_attempts {
        if start.elapsed() >= config.overall_timeout {
            warn!(target: "ctx.retry", attempt, "overall timeout exceeded");
            return Err(ctx_error::CtxError::new(
                ctx_error::ErrorCode::TimeoutOperation,
                "retry overall timeout exceeded",
            ));
        }

        debug!(target: "ctx.retry", attempt, max_attempts, "attempting operation");

        match op().await {
            Ok(value) => {
                let total_duration = start.elapsed();
                debug!(
                    target: "ctx.retry",
                    attempt,
                    total_duration_ms = total_duration.as_millis() as u64,
                    "operation succeeded"
                );
                return Ok(RetryOutcome {
                    value,
                    metadata: RetryMetadata {
                        total_attempts: attempt + 1,
                        failed_attempts,
                        total_duration,
                    },
                });
            }
            Err(err) => {
                let is_last = attempt + 1 >= max_attempts;

                if !retryable(&err) {
                    debug!(target: "ctx.retry", error = %err, "non-retryable error, giving up");
                    return Err(err);
                }

                if is_last {
                    warn!(target: "ctx.retry", error = %err, attempt, "max retries exhausted");
                    return Err(err);
                }

                let delay = compute_delay(config, attempt);
                warn!(
                    target: "ctx.retry",
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retryable error, backing off"
                );

                failed_attempts.push(RetryAttempt {
                    attempt,
                    error: err.to_string(),
                    delay,
                });

                let remaining = config.overall_timeout.saturating_sub(start.elapsed());
                if delay > remaining {
                    return Err(ctx_error::CtxError::new(
                        ctx_error::ErrorCode::TimeoutOperation,
                        "retry overall timeout exceeded",
                    ));
                }

                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(ctx_error::CtxError::new(
        ctx_error::ErrorCode::TimeoutOperation,
        "retry overall timeout exceeded",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctx_error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_respects_cap() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(compute_delay(&config, 0), config.base_delay);
        assert_eq!(compute_delay(&config, 1), config.base_delay * 2);
        assert_eq!(compute_delay(&config, 10), config.max_delay);
    }

    #[test]
    fn jitter_never_exceeds_nominal_delay() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter_factor: 1.0,
            ..RetryConfig::default()
        };
        for attempt in 0..5 {
            let delay = compute_delay(&config, attempt);
            assert!(delay <= config.max_delay);
        }
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        let err = CtxError::new(ErrorCode::ValidationInvariantViolation, "bad record");
        assert!(!is_retryable(&err));
        let err = CtxError::new(ErrorCode::ChecksumMismatchDigest, "bad digest");
        assert!(!is_retryable(&err));
    }

    #[test]
    fn transport_errors_are_retryable() {
        let err = CtxError::new(ErrorCode::BackendUnavailableTransport, "connection refused");
        assert!(is_retryable(&err));
    }

    #[tokio::test]
    async fn retry_async_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            overall_timeout: Duration::from_secs(5),
            jitter_factor: 0.0,
        };
        let outcome = retry_async(
            &config,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CtxError::new(
                            ErrorCode::BackendUnavailableTransport,
                            "flaky",
                        ))
                    } else {
                        Ok(42)
                    }
                }
            },
            is_retryable,
        )
        .await
        .unwrap();

        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.metadata.total_attempts, 3);
        assert_eq!(outcome.metadata.failed_attempts.len(), 2);
    }

    #[tokio::test]
    async fn retry_async_gives_up_immediately_on_terminal_error() {
        let config = RetryConfig::default();
        let result: Result<RetryOutcome<()>, CtxError> = retry_async(
            &config,
            || async { Err(CtxError::new(ErrorCode::ValidationInvariantViolation, "bad")) },
            is_retryable,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, ErrorCode::ValidationInvariantViolation);
    }

    #[tokio::test]
    async fn retry_async_exhausts_max_retries() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            overall_timeout: Duration::from_secs(5),
            jitter_factor: 0.0,
        };
        let result: Result<RetryOutcome<()>, CtxError> = retry_async(
            &config,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CtxError::new(ErrorCode::BackendUnavailableTransport, "down")) }
            },
            is_retryable,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
