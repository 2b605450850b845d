//! Best-effort shutdown hook for long-lived (cached) processes.
//!
//! Ephemeral mode never registers anything: per-request processes are
//! torn down at unpredictable times, and an exit hook there is itself
//! a source of leaked or duplicated hooks. The structural rule (no
//! registration at all) replaces any runtime guard.
//!
//! Cleanup is best-effort only; nothing in the subsystem relies on
//! this hook running for correctness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::handle::HandleMode;
use crate::lifecycle::LifecycleCoordinator;

static REGISTERED: AtomicBool = AtomicBool::new(false);

/// Register the process shutdown hook. Returns `true` if a hook was
/// registered by this call: registration happens at most once per
/// process, and never in ephemeral mode.
pub fn register(coordinator: Arc<LifecycleCoordinator>) -> bool {
    if coordinator.mode() == HandleMode::Ephemeral {
        debug!("ephemeral handle mode: shutdown hook not registered");
        return false;
    }
    if REGISTERED.swap(true, Ordering::SeqCst) {
        debug!("shutdown hook already registered");
        return false;
    }

    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received, closing cached database handle");
        coordinator.close().await;
    });
    true
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
    }
}
