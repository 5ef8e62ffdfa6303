//! Graceful shutdown: reverse-dependency teardown driven by one
//! process-wide readiness flag.
//!
//! The ordering is a correctness invariant: the readiness probe flips
//! first (so load balancers stop routing), the scheduler stops next (no new
//! claims), in-flight work drains, and the connection pool closes LAST so
//! nothing still issuing queries observes a torn-down pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::pipeline::manager::RunManager;

/// The single process-wide readiness flag. Reset implicitly on process
/// restart.
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// Flip the readiness flag. Idempotent: returns `true` only for the call
/// that actually flipped it.
pub fn set_shutting_down() -> bool {
    !SHUTTING_DOWN.swap(true, Ordering::SeqCst)
}

/// Whether shutdown has begun. Read by the readiness probe.
pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}

/// Clear the flag. Only tests run multiple "process lifetimes" in one
/// process; production never calls this.
pub fn reset_shutting_down() {
    SHUTTING_DOWN.store(false, Ordering::SeqCst);
}

/// Drives the teardown sequence.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    /// Pause after flipping readiness, giving routers time to observe it.
    pub lb_drain: Duration,
    /// Pause after stopping the scheduler, letting claimed dispatches land.
    pub task_drain: Duration,
    /// Bound on waiting for the pool to close.
    pub pool_close_timeout: Duration,
}

impl ShutdownController {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            lb_drain: config.shutdown_lb_drain,
            task_drain: config.shutdown_task_drain,
            pool_close_timeout: config.shutdown_pool_close_timeout,
        }
    }

    /// Run the full sequence. Errors along the way are logged, never
    /// propagated: shutdown always proceeds to the pool close.
    pub async fn run(
        &self,
        scheduler_stop: CancellationToken,
        scheduler_task: Option<JoinHandle<()>>,
        run_manager: &RunManager,
        pool: &PgPool,
    ) {
        // 1. Readiness flips before anything else stops.
        if set_shutting_down() {
            info!("shutdown started, readiness now failing");
        } else {
            info!("shutdown already in progress");
        }

        // 2. Load-balancer drain window.
        tokio::time::sleep(self.lb_drain).await;

        // 3. Stop the scheduler; it finishes its current tick and spawns
        //    nothing more.
        scheduler_stop.cancel();
        if let Some(task) = scheduler_task {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }

        // 4. In-flight drain window for tasks already past the advisory
        //    lock and mid-dispatch.
        tokio::time::sleep(self.task_drain).await;

        // 5. Cancel whatever is still running, generously.
        run_manager.shutdown(pool, self.pool_close_timeout).await;

        // 6. The pool closes last.
        match tokio::time::timeout(self.pool_close_timeout, pool.close()).await {
            Ok(()) => info!("connection pool closed"),
            Err(_) => warn!("pool close exceeded its timeout, abandoning connections"),
        }

        info!("shutdown complete");
    }
}
