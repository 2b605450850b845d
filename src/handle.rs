//! Connection handle: one live database session plus identity metadata.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

/// Reuse policy for handles within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    /// One acquisition, then discarded. Per-request semantics for
    /// runtimes that may tear the process down after any request.
    Ephemeral,
    /// Reused across acquisitions for as long as the process lives.
    Cached,
}

impl FromStr for HandleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ephemeral" => Ok(HandleMode::Ephemeral),
            "cached" => Ok(HandleMode::Cached),
            other => Err(format!("unrecognized handle mode: {other}")),
        }
    }
}

/// Owns exactly one live database session.
///
/// The inner pool is capped at the resolved `max_connections` (1 under
/// transaction pooling or ephemeral mode), so the handle's "one
/// session" semantics hold even though sqlx models it as a pool.
///
/// In cached mode the handle is shared as `Arc<ConnectionHandle>` and
/// handed out by reference on each acquisition. Callers never close it
/// directly; teardown is reserved for the lifecycle coordinator and
/// the retry policy.
pub struct ConnectionHandle {
    instance_id: Uuid,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    is_healthy: AtomicBool,
    mode: HandleMode,
    pool: PgPool,
}

impl ConnectionHandle {
    pub(crate) fn new(instance_id: Uuid, pool: PgPool, mode: HandleMode) -> Self {
        let now = Instant::now();
        Self {
            instance_id,
            created_at: now,
            last_used_at: Mutex::new(now),
            is_healthy: AtomicBool::new(false),
            mode,
            pool,
        }
    }

    /// Opaque identity, generated at construction.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    /// The underlying session for running queries.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn last_used_at(&self) -> Instant {
        *self.last_used_at.lock()
    }

    /// True once the handle has passed the health probe and has not
    /// since been marked degraded or broken.
    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Acquire)
    }

    /// Written only by the health probe.
    pub(crate) fn mark_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        *self.last_used_at.lock() = Instant::now();
    }

    /// Close the underlying session. Reserved for the coordinator and
    /// the retry policy; closing a shared handle out from under a
    /// concurrent caller is exactly the failure mode this restriction
    /// prevents.
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("instance_id", &self.instance_id)
            .field("mode", &self.mode)
            .field("is_healthy", &self.is_healthy.load(Ordering::Relaxed))
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}
