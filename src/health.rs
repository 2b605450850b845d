//! Health probe: one cheap, collision-free round trip.

use std::time::{Duration, Instant};

use rand::{distributions::Alphanumeric, Rng};
use tracing::{debug, warn};

use crate::error::LifecycleError;
use crate::handle::ConnectionHandle;

/// Validate a handle with a single round trip.
///
/// The query text embeds a fresh random literal on every invocation so
/// no prepared statement can ever be reused for it, server side or
/// client side. The result is deterministic and ignorable apart from
/// `pg_is_in_recovery()`, which flags an unexpectedly read-only
/// session.
///
/// Returns `Ok(true)` for a healthy handle, `Ok(false)` when the round
/// trip works but the session is degraded, and an error when the round
/// trip itself fails or exceeds `probe_timeout`.
pub async fn check(
    handle: &ConnectionHandle,
    probe_timeout: Duration,
) -> Result<bool, LifecycleError> {
    let started = Instant::now();
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    let sql = format!(
        "SELECT pg_is_in_recovery(), 'probe_{}'::text",
        nonce.to_lowercase()
    );

    let query = sqlx::query_as::<_, (bool, String)>(&sql).fetch_one(handle.pool());

    match tokio::time::timeout(probe_timeout, query).await {
        Ok(Ok((in_recovery, _))) => {
            handle.mark_healthy(!in_recovery);
            if in_recovery {
                warn!(
                    instance_id = %handle.instance_id(),
                    "health probe: session is read-only (in recovery), marking degraded"
                );
                Ok(false)
            } else {
                debug!(instance_id = %handle.instance_id(), "health probe passed");
                Ok(true)
            }
        }
        Ok(Err(e)) => {
            handle.mark_healthy(false);
            warn!(
                instance_id = %handle.instance_id(),
                error = %e,
                "health probe round trip failed"
            );
            Err(LifecycleError::from_driver(
                e,
                started.elapsed(),
                "health probe",
            ))
        }
        Err(_) => {
            handle.mark_healthy(false);
            warn!(
                instance_id = %handle.instance_id(),
                timeout = ?probe_timeout,
                "health probe timed out"
            );
            Err(LifecycleError::Timeout {
                elapsed: probe_timeout,
                context: "health probe".to_string(),
            })
        }
    }
}
