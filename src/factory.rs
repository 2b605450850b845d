//! Connection factory: builds a new handle from a resolved config.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::error::LifecycleError;
use crate::handle::{ConnectionHandle, HandleMode};
use crate::health;

/// Produces connection handles. The production implementation is
/// [`PgFactory`]; the seam exists so the coordinator's policy can be
/// exercised without a reachable database server.
#[async_trait]
pub trait HandleFactory: Send + Sync {
    /// Construct a new handle. Always a fresh instance; the factory
    /// never caches and never retries internally.
    async fn create(
        &self,
        config: &ConnectionConfig,
        mode: HandleMode,
    ) -> Result<ConnectionHandle, LifecycleError>;

    /// Validate a handle with one cheap round trip. `Ok(false)` means
    /// the session works but is degraded (e.g. read-only).
    async fn probe(
        &self,
        handle: &ConnectionHandle,
        timeout: Duration,
    ) -> Result<bool, LifecycleError> {
        health::check(handle, timeout).await
    }
}

/// sqlx/PostgreSQL factory.
///
/// Opening the network connection is deferred to first use
/// (`connect_lazy_with`): construction only parses options, so the
/// first real round trip happens inside the health probe, where it is
/// bounded by the probe timeout and classified centrally. This choice
/// is deliberate and consistent; `create` itself can only fail on a
/// malformed URL.
pub struct PgFactory;

#[async_trait]
impl HandleFactory for PgFactory {
    async fn create(
        &self,
        config: &ConnectionConfig,
        mode: HandleMode,
    ) -> Result<ConnectionHandle, LifecycleError> {
        let instance_id = Uuid::new_v4();

        let mut options = crate::config::parse_endpoint(&config.endpoint_url)?;

        if !config.statement_cache_enabled {
            // Transaction poolers reassign server connections between
            // clients; a client-side statement cache is a liability.
            options = options.statement_cache_capacity(0);
        }

        if let Some(ssl_mode) = config.ssl_mode {
            options = options.ssl_mode(ssl_mode);
        }

        // Per-instance identity: resolution tag plus an instance
        // suffix, so the pooler never sees two sessions with the same
        // name even within one process.
        let instance_suffix = instance_id.simple().to_string();
        let application_name =
            format!("{}_{}", config.application_tag, &instance_suffix[..8]);
        options = options.application_name(&application_name);

        // Server-side ceilings, kept below the platform request
        // timeout so a wedged statement cannot outlive the request.
        options = options.options([
            (
                "statement_timeout",
                config.statement_timeout.as_millis().to_string(),
            ),
            ("lock_timeout", config.lock_timeout.as_millis().to_string()),
        ]);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(0)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(config.idle_timeout)
            // The health probe owns validation; sqlx's own ping would
            // add a round trip per acquire on top of it.
            .test_before_acquire(false)
            .connect_lazy_with(options);

        debug!(
            instance_id = %instance_id,
            application_name = %application_name,
            max_connections = config.max_connections,
            statement_cache = config.statement_cache_enabled,
            "created connection handle"
        );

        Ok(ConnectionHandle::new(instance_id, pool, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawSettings;

    fn pooled_config() -> ConnectionConfig {
        let settings = RawSettings {
            database_url: Some("postgres://user:pw@localhost:6543/app".to_string()),
            pooled_endpoint: true,
            ..RawSettings::default()
        };
        ConnectionConfig::resolve(&settings).unwrap()
    }

    #[tokio::test]
    async fn create_is_lazy_and_succeeds_without_a_server() {
        let factory = PgFactory;
        let handle = factory
            .create(&pooled_config(), HandleMode::Cached)
            .await
            .expect("lazy creation must not touch the network");
        assert!(!handle.is_healthy());
        assert_eq!(handle.mode(), HandleMode::Cached);
    }

    #[tokio::test]
    async fn create_rejects_malformed_url() {
        let mut config = pooled_config();
        config.endpoint_url = "mysql://wrong/driver".to_string();

        let err = PgFactory
            .create(&config, HandleMode::Ephemeral)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));
    }

    #[tokio::test]
    async fn handles_get_distinct_instance_ids() {
        let config = pooled_config();
        let a = PgFactory.create(&config, HandleMode::Cached).await.unwrap();
        let b = PgFactory.create(&config, HandleMode::Cached).await.unwrap();
        assert_ne!(a.instance_id(), b.instance_id());
    }
}
