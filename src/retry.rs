//! Retry/reset policy with exponential backoff.
//!
//! Wraps caller operations that use a connection handle. A recognized
//! transient failure (pooler protocol desync, connection reset,
//! expired auth session) forces the coordinator onto the cold path and
//! the operation is retried against a freshly created, freshly probed
//! handle. Everything else propagates on the first attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RawSettings;
use crate::error::{classify, ErrorClass, LifecycleError};
use crate::handle::ConnectionHandle;
use crate::lifecycle::LifecycleCoordinator;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first. Default 3 (one original
    /// plus two retries).
    pub max_attempts: u32,
    /// Initial backoff. Default 100ms.
    pub backoff_base: Duration,
    /// Exponential multiplier. Default 2.0.
    pub backoff_multiplier: f64,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Randomize each delay by ±30% to avoid thundering retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub(crate) fn from_settings(settings: &RawSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            backoff_base: Duration::from_millis(settings.retry_backoff_base_ms),
            ..Self::default()
        }
    }
}

/// Run `op` against an acquired handle, retrying transient failures.
///
/// Per attempt: acquire, run, classify on failure. Transient classes
/// tear the cached handle down (`force_cold`) and retry after backoff;
/// non-transient failures and timeouts return immediately. Exhausted
/// retries surface as [`LifecycleError::ServiceUnavailable`] carrying
/// the last cause.
pub async fn with_retry<F, Fut, T>(
    coordinator: &LifecycleCoordinator,
    config: &RetryConfig,
    mut op: F,
) -> Result<T, LifecycleError>
where
    F: FnMut(Arc<ConnectionHandle>) -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut backoff = config.backoff_base;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let acquired = match coordinator.acquire().await {
            Ok(acquired) => acquired,
            Err(e) if e.is_transient() => {
                if attempt >= config.max_attempts {
                    warn!(attempts = attempt, "retries exhausted during acquisition");
                    return Err(LifecycleError::ServiceUnavailable {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                let delay = apply_jitter(backoff, config.jitter);
                warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient acquisition failure, backing off"
                );
                tokio::time::sleep(delay).await;
                backoff = next_backoff(backoff, config);
                continue;
            }
            // Config errors, timeouts: not retryable here.
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        match op(Arc::clone(&acquired.handle)).await {
            Ok(value) => {
                debug!(
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "operation succeeded"
                );
                return Ok(value);
            }
            Err(e) => {
                let class = classify(&e);
                match class {
                    ErrorClass::NonTransient => {
                        return Err(LifecycleError::Operation { source: e });
                    }
                    ErrorClass::Timeout => {
                        // Logged distinctly: a timeout is not evidence
                        // of pooler breakage, and retrying would stack
                        // deadlines.
                        warn!(
                            attempt,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            error = %e,
                            "operation timed out, not retrying"
                        );
                        return Err(LifecycleError::Timeout {
                            elapsed: started.elapsed(),
                            context: "wrapped operation".to_string(),
                        });
                    }
                    ErrorClass::Protocol
                    | ErrorClass::ConnectionReset
                    | ErrorClass::AuthExpired => {
                        if attempt >= config.max_attempts {
                            warn!(
                                attempts = attempt,
                                class = class.as_str(),
                                "retries exhausted"
                            );
                            // The teardown is tied to the transient
                            // error itself: the handle that produced
                            // it must not stay cached for the next
                            // caller even though no retry follows.
                            coordinator.force_cold(class.as_str()).await;
                            let source = match class {
                                ErrorClass::Protocol => {
                                    LifecycleError::Protocol { source: e }
                                }
                                _ => LifecycleError::Connection { source: e },
                            };
                            return Err(LifecycleError::ServiceUnavailable {
                                attempts: attempt,
                                source: Box::new(source),
                            });
                        }

                        let delay = apply_jitter(backoff, config.jitter);
                        warn!(
                            attempt,
                            max_attempts = config.max_attempts,
                            class = class.as_str(),
                            delay_ms = delay.as_millis() as u64,
                            instance_id = %acquired.handle.instance_id(),
                            "transient database error, resetting handle and retrying"
                        );
                        coordinator.force_cold(class.as_str()).await;
                        tokio::time::sleep(delay).await;
                        backoff = next_backoff(backoff, config);
                    }
                }
            }
        }
    }
}

impl LifecycleCoordinator {
    /// [`with_retry`] using this coordinator's configured policy.
    pub async fn with_retry<F, Fut, T>(&self, op: F) -> Result<T, LifecycleError>
    where
        F: FnMut(Arc<ConnectionHandle>) -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let config = self.retry_config().clone();
        with_retry(self, &config, op).await
    }
}

fn next_backoff(current: Duration, config: &RetryConfig) -> Duration {
    Duration::from_millis(
        ((current.as_millis() as f64 * config.backoff_multiplier)
            .min(config.max_backoff.as_millis() as f64)) as u64,
    )
}

fn apply_jitter(base: Duration, jitter: bool) -> Duration {
    if jitter {
        let factor: f64 = rand::thread_rng().gen_range(0.7..1.3);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    } else {
        base
    }
}
