//! Lifecycle coordinator: the single owner of the reuse-or-recreate
//! policy.
//!
//! Serverless runtimes give no reliable signal about process lifetime:
//! the same process may serve one request and die, or serve thousands
//! while looking "fresh" each time. The coordinator infers the regime
//! from elapsed time and invocation count, forces a cold path when the
//! underlying session was likely dropped by an intermediary, and never
//! hands out a handle that has not passed the health probe since its
//! creation or last reset.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::{ConnectionConfig, RawSettings};
use crate::error::LifecycleError;
use crate::factory::{HandleFactory, PgFactory};
use crate::handle::{ConnectionHandle, HandleMode};
use crate::metrics;
use crate::retry::RetryConfig;

/// Probe deadline. Fixed short so a hung probe can never approach the
/// host platform's own request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How an acquisition was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A cached handle was handed out again.
    Reused,
    /// A fresh handle was created (cold path or ephemeral mode).
    Recreated,
}

impl AcquireOutcome {
    fn as_str(self) -> &'static str {
        match self {
            AcquireOutcome::Reused => "reused",
            AcquireOutcome::Recreated => "recreated",
        }
    }
}

/// A successfully acquired handle plus how it was obtained.
#[derive(Debug)]
pub struct Acquired {
    pub handle: Arc<ConnectionHandle>,
    pub outcome: AcquireOutcome,
    /// The probe round trip succeeded but found the session impaired
    /// (e.g. read-only). The handle is usable; the caller decides.
    pub degraded: bool,
}

impl Acquired {
    /// Strict variant: reject a degraded handle instead of passing it
    /// through.
    pub fn ensure_healthy(self) -> Result<Arc<ConnectionHandle>, LifecycleError> {
        if self.degraded {
            Err(LifecycleError::Degraded(format!(
                "handle {} is usable but degraded",
                self.handle.instance_id()
            )))
        } else {
            Ok(self.handle)
        }
    }
}

/// Process-wide invocation bookkeeping. Owned by the coordinator, not
/// module-level state.
struct LifecycleState {
    request_counter: AtomicU64,
    last_request_at: Mutex<Option<Instant>>,
    first_invocation: AtomicBool,
}

impl LifecycleState {
    fn new() -> Self {
        Self {
            request_counter: AtomicU64::new(0),
            last_request_at: Mutex::new(None),
            first_invocation: AtomicBool::new(true),
        }
    }

    /// Advance the counter and the last-request timestamp, returning
    /// the new count and the gap since the previous request. Runs
    /// before any outcome is known, so counters advance on failures
    /// too.
    fn begin_request(&self) -> (u64, Option<Duration>) {
        let count = self.request_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut last = self.last_request_at.lock();
        let since = last.map(|t| t.elapsed());
        *last = Some(Instant::now());
        (count, since)
    }
}

/// The sole public entry point for obtaining a database handle.
pub struct LifecycleCoordinator {
    config: ConnectionConfig,
    factory: Arc<dyn HandleFactory>,
    state: LifecycleState,
    // Serializes cached-handle turnover: concurrent acquires in one
    // process must not race a teardown.
    cached: AsyncMutex<Option<Arc<ConnectionHandle>>>,
    mode: HandleMode,
    idle_threshold: Duration,
    probe_timeout: Duration,
    retry: RetryConfig,
}

impl LifecycleCoordinator {
    /// Build a coordinator with the production factory.
    pub fn new(config: ConnectionConfig, settings: &RawSettings) -> Self {
        Self::with_factory(config, settings, Arc::new(PgFactory))
    }

    /// Build a coordinator around a custom factory (alternative
    /// drivers, tests).
    pub fn with_factory(
        config: ConnectionConfig,
        settings: &RawSettings,
        factory: Arc<dyn HandleFactory>,
    ) -> Self {
        Self {
            config,
            factory,
            state: LifecycleState::new(),
            cached: AsyncMutex::new(None),
            mode: settings.handle_mode,
            idle_threshold: Duration::from_secs(settings.idle_reset_threshold_secs),
            probe_timeout: PROBE_TIMEOUT,
            retry: RetryConfig::from_settings(settings),
        }
    }

    /// Resolve configuration from the environment and build a
    /// coordinator. A missing or malformed `DATABASE_URL` aborts here;
    /// nothing downstream retries configuration errors.
    pub fn from_env() -> Result<Self, LifecycleError> {
        let settings = RawSettings::from_env();
        let config = ConnectionConfig::resolve(&settings)?;
        Ok(Self::new(config, &settings))
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Total acquisitions attempted by this process. Strictly
    /// increasing; reset only by process restart.
    pub fn request_counter(&self) -> u64 {
        self.state.request_counter.load(Ordering::SeqCst)
    }

    /// Acquire a usable database handle.
    ///
    /// Cold path (first invocation, idle gap exceeded, or no healthy
    /// cached handle): discard anything cached, create, probe. Warm
    /// path: hand the cached handle out again. Counters and timestamps
    /// advance regardless of outcome.
    pub async fn acquire(&self) -> Result<Acquired, LifecycleError> {
        let started = Instant::now();
        let (count, since_last) = self.state.begin_request();
        let first = self.state.first_invocation.load(Ordering::SeqCst);

        let went_idle = since_last.map_or(false, |gap| gap > self.idle_threshold);
        let force_cold = first || went_idle;

        if went_idle {
            debug!(
                request_counter = count,
                time_since_last_ms = since_last.map(|d| d.as_millis() as u64),
                idle_threshold_ms = self.idle_threshold.as_millis() as u64,
                "idle threshold exceeded, forcing cold acquisition"
            );
        }

        let result = self.acquire_inner(force_cold).await;

        match &result {
            Ok(acquired) => {
                self.state.first_invocation.store(false, Ordering::SeqCst);
                metrics::record_acquisition(acquired.outcome.as_str(), started.elapsed());
                info!(
                    instance_id = %acquired.handle.instance_id(),
                    request_counter = count,
                    time_since_last_ms = since_last.map(|d| d.as_millis() as u64),
                    outcome = acquired.outcome.as_str(),
                    degraded = acquired.degraded,
                    "database handle acquired"
                );
            }
            Err(e) => {
                metrics::record_acquisition("failed", started.elapsed());
                error!(
                    request_counter = count,
                    time_since_last_ms = since_last.map(|d| d.as_millis() as u64),
                    outcome = "failed",
                    error = %e,
                    "database handle acquisition failed"
                );
            }
        }

        result
    }

    async fn acquire_inner(&self, force_cold: bool) -> Result<Acquired, LifecycleError> {
        match self.mode {
            HandleMode::Ephemeral => {
                // One handle per acquisition; nothing to reuse or
                // discard. Ownership passes to the caller and ends
                // with the request.
                let (handle, degraded) = self.create_checked().await?;
                Ok(Acquired {
                    handle: Arc::new(handle),
                    outcome: AcquireOutcome::Recreated,
                    degraded,
                })
            }
            HandleMode::Cached => {
                let mut cached = self.cached.lock().await;

                if force_cold {
                    if let Some(old) = cached.take() {
                        self.discard(&old, "cold_transition").await;
                    }
                }

                if let Some(handle) = cached.as_ref() {
                    if handle.is_healthy() {
                        handle.touch();
                        return Ok(Acquired {
                            handle: Arc::clone(handle),
                            outcome: AcquireOutcome::Reused,
                            degraded: false,
                        });
                    }
                    // Cached but marked unhealthy since the last probe.
                    let old = cached.take();
                    if let Some(old) = old {
                        self.discard(&old, "unhealthy_cached").await;
                    }
                }

                let (handle, degraded) = self.create_checked().await?;
                let handle = Arc::new(handle);
                *cached = Some(Arc::clone(&handle));
                Ok(Acquired {
                    handle,
                    outcome: AcquireOutcome::Recreated,
                    degraded,
                })
            }
        }
    }

    /// Factory create followed by the health probe. A probe failure
    /// drops the partially constructed handle here; it is never cached
    /// and never reaches a caller.
    async fn create_checked(&self) -> Result<(ConnectionHandle, bool), LifecycleError> {
        let handle = self.factory.create(&self.config, self.mode).await?;
        let healthy = self.factory.probe(&handle, self.probe_timeout).await?;
        Ok((handle, !healthy))
    }

    /// Force the next acquisition onto the cold path by discarding any
    /// cached handle now. Used by the retry policy after a transient
    /// failure; a no-op in ephemeral mode.
    pub async fn force_cold(&self, reason: &str) {
        if self.mode == HandleMode::Ephemeral {
            return;
        }
        let mut cached = self.cached.lock().await;
        match cached.take() {
            Some(old) => self.discard(&old, reason).await,
            None => debug!(reason, "force_cold: no cached handle to discard"),
        }
    }

    async fn discard(&self, handle: &Arc<ConnectionHandle>, reason: &str) {
        info!(
            instance_id = %handle.instance_id(),
            request_counter = self.request_counter(),
            reason,
            age_ms = handle.age().as_millis() as u64,
            "discarding database handle"
        );
        metrics::record_reset(reason);
        handle.close().await;
    }

    /// One-shot boot diagnostic: a single acquisition, logged. Callers
    /// that want fail-fast startup run this before serving traffic.
    pub async fn startup_check(&self) -> Result<Acquired, LifecycleError> {
        let acquired = self.acquire().await?;
        if acquired.degraded {
            warn!(
                instance_id = %acquired.handle.instance_id(),
                "startup check: handle acquired but degraded"
            );
        } else {
            info!(
                instance_id = %acquired.handle.instance_id(),
                "startup check passed"
            );
        }
        Ok(acquired)
    }

    /// Best-effort teardown of the cached handle. Failure here is
    /// logged, never escalated; correctness does not depend on this
    /// running.
    pub async fn close(&self) {
        let mut cached = self.cached.lock().await;
        if let Some(handle) = cached.take() {
            info!(
                instance_id = %handle.instance_id(),
                "closing cached database handle"
            );
            handle.close().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn has_cached_handle(&self) -> bool {
        self.cached.lock().await.is_some()
    }
}

// The endpoint URL stays redacted through the nested config Debug.
impl fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("idle_threshold", &self.idle_threshold)
            .field("request_counter", &self.request_counter())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RawSettings;
    use async_trait::async_trait;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::atomic::AtomicU32;
    use uuid::Uuid;

    /// Factory stub: counts creations, probes succeed (or degrade /
    /// fail) without any server.
    pub(crate) struct StubFactory {
        pub creates: AtomicU32,
        pub probes: AtomicU32,
        pub probe_result: ProbeBehavior,
    }

    #[derive(Clone, Copy)]
    pub(crate) enum ProbeBehavior {
        Healthy,
        Degraded,
        Fail,
    }

    impl StubFactory {
        pub(crate) fn healthy() -> Self {
            Self::with_probe(ProbeBehavior::Healthy)
        }

        pub(crate) fn with_probe(probe_result: ProbeBehavior) -> Self {
            Self {
                creates: AtomicU32::new(0),
                probes: AtomicU32::new(0),
                probe_result,
            }
        }

        pub(crate) fn created(&self) -> u32 {
            self.creates.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HandleFactory for StubFactory {
        async fn create(
            &self,
            _config: &ConnectionConfig,
            mode: HandleMode,
        ) -> Result<ConnectionHandle, LifecycleError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_lazy("postgres://stub@localhost:1/stub")
                .map_err(|e| LifecycleError::Config(e.to_string()))?;
            Ok(ConnectionHandle::new(Uuid::new_v4(), pool, mode))
        }

        async fn probe(
            &self,
            handle: &ConnectionHandle,
            _timeout: Duration,
        ) -> Result<bool, LifecycleError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            match self.probe_result {
                ProbeBehavior::Healthy => {
                    handle.mark_healthy(true);
                    Ok(true)
                }
                ProbeBehavior::Degraded => {
                    handle.mark_healthy(false);
                    Ok(false)
                }
                ProbeBehavior::Fail => {
                    handle.mark_healthy(false);
                    Err(LifecycleError::Connection {
                        source: sqlx::Error::Io(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            "stub: connection refused",
                        )),
                    })
                }
            }
        }
    }

    pub(crate) fn test_settings(mode: HandleMode, idle_threshold_secs: u64) -> RawSettings {
        RawSettings {
            database_url: Some("postgres://stub@localhost:1/stub".to_string()),
            pooled_endpoint: true,
            handle_mode: mode,
            idle_reset_threshold_secs: idle_threshold_secs,
            retry_backoff_base_ms: 1,
            ..RawSettings::default()
        }
    }

    pub(crate) fn coordinator_with(
        factory: Arc<StubFactory>,
        mode: HandleMode,
        idle_threshold: Duration,
    ) -> LifecycleCoordinator {
        let settings = test_settings(mode, 60);
        let config = ConnectionConfig::resolve(&settings).unwrap();
        let mut coordinator = LifecycleCoordinator::with_factory(config, &settings, factory);
        coordinator.idle_threshold = idle_threshold;
        coordinator
    }

    #[tokio::test]
    async fn first_acquire_always_creates_and_probes() {
        // Cold process, reachable endpoint: healthy handle, counter 1.
        let factory = Arc::new(StubFactory::healthy());
        let coordinator =
            coordinator_with(Arc::clone(&factory), HandleMode::Cached, Duration::from_secs(60));

        let acquired = coordinator.acquire().await.unwrap();
        assert_eq!(acquired.outcome, AcquireOutcome::Recreated);
        assert!(acquired.handle.is_healthy());
        assert!(!acquired.degraded);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.probes.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.request_counter(), 1);
    }

    #[tokio::test]
    async fn warm_acquire_reuses_cached_handle() {
        // Last request a moment ago, threshold generous: reuse, no new
        // factory call.
        let factory = Arc::new(StubFactory::healthy());
        let coordinator =
            coordinator_with(Arc::clone(&factory), HandleMode::Cached, Duration::from_secs(60));

        let first = coordinator.acquire().await.unwrap();
        let second = coordinator.acquire().await.unwrap();

        assert_eq!(second.outcome, AcquireOutcome::Reused);
        assert_eq!(first.handle.instance_id(), second.handle.instance_id());
        assert_eq!(factory.created(), 1);
        assert_eq!(coordinator.request_counter(), 2);
    }

    #[tokio::test]
    async fn idle_gap_forces_recreation() {
        // Last request longer ago than the threshold: discard + create.
        let factory = Arc::new(StubFactory::healthy());
        let coordinator = coordinator_with(
            Arc::clone(&factory),
            HandleMode::Cached,
            Duration::from_millis(20),
        );

        let first = coordinator.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = coordinator.acquire().await.unwrap();

        assert_eq!(second.outcome, AcquireOutcome::Recreated);
        assert_ne!(first.handle.instance_id(), second.handle.instance_id());
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn ephemeral_mode_creates_per_acquisition() {
        let factory = Arc::new(StubFactory::healthy());
        let coordinator =
            coordinator_with(Arc::clone(&factory), HandleMode::Ephemeral, Duration::from_secs(60));

        let a = coordinator.acquire().await.unwrap();
        let b = coordinator.acquire().await.unwrap();

        assert_eq!(a.outcome, AcquireOutcome::Recreated);
        assert_eq!(b.outcome, AcquireOutcome::Recreated);
        assert_ne!(a.handle.instance_id(), b.handle.instance_id());
        assert_eq!(factory.created(), 2);
        assert!(!coordinator.has_cached_handle().await);
    }

    #[tokio::test]
    async fn counter_advances_even_when_acquisition_fails() {
        let factory = Arc::new(StubFactory::with_probe(ProbeBehavior::Fail));
        let coordinator =
            coordinator_with(Arc::clone(&factory), HandleMode::Cached, Duration::from_secs(60));

        let err = coordinator.acquire().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Connection { .. }));
        assert_eq!(coordinator.request_counter(), 1);
        // Nothing half-built may be cached.
        assert!(!coordinator.has_cached_handle().await);

        let err = coordinator.acquire().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Connection { .. }));
        assert_eq!(coordinator.request_counter(), 2);
    }

    #[tokio::test]
    async fn degraded_probe_surfaces_with_handle() {
        let factory = Arc::new(StubFactory::with_probe(ProbeBehavior::Degraded));
        let coordinator =
            coordinator_with(Arc::clone(&factory), HandleMode::Cached, Duration::from_secs(60));

        let acquired = coordinator.acquire().await.unwrap();
        assert!(acquired.degraded);
        assert!(!acquired.handle.is_healthy());
        assert!(matches!(
            acquired.ensure_healthy(),
            Err(LifecycleError::Degraded(_))
        ));

        // A degraded cached handle is not blindly reused.
        let again = coordinator.acquire().await.unwrap();
        assert_eq!(again.outcome, AcquireOutcome::Recreated);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn force_cold_discards_cached_handle() {
        let factory = Arc::new(StubFactory::healthy());
        let coordinator =
            coordinator_with(Arc::clone(&factory), HandleMode::Cached, Duration::from_secs(60));

        coordinator.acquire().await.unwrap();
        assert!(coordinator.has_cached_handle().await);

        coordinator.force_cold("test_reset").await;
        assert!(!coordinator.has_cached_handle().await);

        let acquired = coordinator.acquire().await.unwrap();
        assert_eq!(acquired.outcome, AcquireOutcome::Recreated);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn from_env_without_url_fails_before_any_handle_work() {
        // Missing endpoint URL dies at resolution; the factory is
        // never consulted.
        std::env::remove_var("DATABASE_URL");
        let err = LifecycleCoordinator::from_env().unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));
    }

    #[tokio::test]
    async fn coordinator_debug_redacts_endpoint() {
        let coordinator = coordinator_with(
            Arc::new(StubFactory::healthy()),
            HandleMode::Cached,
            Duration::from_secs(60),
        );
        let rendered = format!("{coordinator:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("localhost:1"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let factory = Arc::new(StubFactory::healthy());
        let coordinator =
            coordinator_with(Arc::clone(&factory), HandleMode::Cached, Duration::from_secs(60));

        coordinator.acquire().await.unwrap();
        coordinator.close().await;
        assert!(!coordinator.has_cached_handle().await);
        // Second close finds nothing; must not panic.
        coordinator.close().await;
    }
}
