//! Run manager: tracks live pipeline runs, enforces per-run timeouts, and
//! exposes two-phase cancellation.
//!
//! Cleanup invariant: every exit path of a spawned run -- completion,
//! internal error, timeout, cooperative cancel, forced abort -- removes the
//! run's entry, so `active_runs` never reports a dead run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use conclave_db::models::{PipelineRun, RunStatus};
use conclave_db::queries::pipeline_runs;

use crate::events::{self, EventSink, OrchestrationEvent};

use super::executor::PipelineExecutor;

/// Bookkeeping for one live run.
struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<Option<RunStatus>>,
    events: Arc<dyn EventSink>,
    join: Option<JoinHandle<()>>,
}

/// Awaitable terminal status of a started run.
pub struct RunWaiter {
    done: watch::Receiver<Option<RunStatus>>,
}

impl RunWaiter {
    /// Wait for the run's terminal status.
    ///
    /// Returns `None` only if the run task vanished without reporting
    /// (it was forcibly aborted).
    pub async fn wait(mut self) -> Option<RunStatus> {
        loop {
            if let Some(status) = *self.done.borrow() {
                return Some(status);
            }
            if self.done.changed().await.is_err() {
                return *self.done.borrow();
            }
        }
    }
}

/// Owner of all live runs in this process.
///
/// The map is guarded by a plain mutex held only for map mutation; executor
/// tasks run entirely outside the lock.
pub struct RunManager {
    runs: Arc<Mutex<HashMap<Uuid, RunHandle>>>,
    /// How long `cancel` waits for the cooperative flag to land before
    /// forcibly aborting the task.
    drain: Duration,
}

impl RunManager {
    pub const DEFAULT_CANCEL_DRAIN: Duration = Duration::from_secs(5);

    pub fn new(drain: Duration) -> Self {
        Self {
            runs: Arc::new(Mutex::new(HashMap::new())),
            drain,
        }
    }

    /// Spawn `executor` for `run` under a per-run timeout.
    ///
    /// On timeout the executor future is dropped and the run's status is set
    /// to `timeout` (write-once, so a racing normal completion wins at most
    /// once).
    pub fn start(
        &self,
        pool: PgPool,
        run: PipelineRun,
        executor: PipelineExecutor,
        timeout: Duration,
    ) -> RunWaiter {
        let run_id = run.id;
        let cancel = executor.cancel_token();
        let events = executor.events();
        let (tx, rx) = watch::channel(None);

        // Register before spawning so no observer sees the run as absent
        // while its task is being set up.
        {
            let mut runs = self.runs.lock().expect("run map poisoned");
            runs.insert(
                run_id,
                RunHandle {
                    cancel: cancel.clone(),
                    done: rx.clone(),
                    events: Arc::clone(&events),
                    join: None,
                },
            );
        }

        let runs_map = Arc::clone(&self.runs);
        let join = tokio::spawn(async move {
            let status = match tokio::time::timeout(timeout, executor.run(&pool, &run)).await {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => {
                    warn!(run_id = %run_id, error = %e, "executor failed internally");
                    let message = format!("internal executor error: {e:#}");
                    finish_quietly(
                        &pool,
                        events.as_ref(),
                        run_id,
                        RunStatus::Failed,
                        Some(&message),
                    )
                    .await;
                    RunStatus::Failed
                }
                Err(_elapsed) => {
                    debug!(run_id = %run_id, "run exceeded its timeout");
                    finish_quietly(
                        &pool,
                        events.as_ref(),
                        run_id,
                        RunStatus::Timeout,
                        Some("run exceeded its timeout"),
                    )
                    .await;
                    RunStatus::Timeout
                }
            };

            // Runs always leave the map here, whatever the outcome. Removal
            // happens before the status broadcast so that anyone woken by
            // the watch already observes the map without this run.
            runs_map.lock().expect("run map poisoned").remove(&run_id);
            let _ = tx.send(Some(status));
        });

        // Attach the join handle unless the task already finished and
        // removed its own entry.
        {
            let mut runs = self.runs.lock().expect("run map poisoned");
            if let Some(handle) = runs.get_mut(&run_id) {
                handle.join = Some(join);
            }
        }

        RunWaiter { done: rx }
    }

    /// Two-phase cancellation.
    ///
    /// Sets the executor's cooperative flag, waits up to the drain window
    /// for the run to reach a terminal state, then aborts the task and
    /// writes `cancelled` itself. Returns `true` iff a live run matched.
    pub async fn cancel(&self, pool: &PgPool, run_id: Uuid) -> bool {
        self.cancel_with_drain(pool, run_id, self.drain).await
    }

    async fn cancel_with_drain(&self, pool: &PgPool, run_id: Uuid, drain: Duration) -> bool {
        let (cancel, mut done, events) = {
            let runs = self.runs.lock().expect("run map poisoned");
            match runs.get(&run_id) {
                Some(h) => (h.cancel.clone(), h.done.clone(), Arc::clone(&h.events)),
                None => return false,
            }
        };

        // Phase one: cooperative.
        cancel.cancel();

        let drained = tokio::time::timeout(drain, async {
            loop {
                if done.borrow().is_some() {
                    break;
                }
                if done.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            // Phase two: forced. The task never got to report or clean up,
            // so the canceller removes the entry and writes the status.
            warn!(run_id = %run_id, "cooperative cancel did not land, aborting run task");
            let join = {
                let mut runs = self.runs.lock().expect("run map poisoned");
                runs.remove(&run_id).and_then(|h| h.join)
            };
            if let Some(join) = join {
                join.abort();
            }
            finish_quietly(
                pool,
                events.as_ref(),
                run_id,
                RunStatus::Cancelled,
                Some("run cancelled"),
            )
            .await;
        }

        true
    }

    /// IDs of runs currently live in this process.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs
            .lock()
            .expect("run map poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.runs
            .lock()
            .expect("run map poisoned")
            .contains_key(&run_id)
    }

    /// Cancel every live run, giving each a generous drain window.
    ///
    /// Used by the shutdown controller after the scheduler has stopped.
    pub async fn shutdown(&self, pool: &PgPool, per_run_drain: Duration) {
        for run_id in self.active_runs() {
            self.cancel_with_drain(pool, run_id, per_run_drain).await;
        }
    }
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CANCEL_DRAIN)
    }
}

/// Terminal-status write that never propagates: logs store failures and
/// emits the matching event only when this writer won the write-once race.
async fn finish_quietly(
    pool: &PgPool,
    events: &dyn EventSink,
    run_id: Uuid,
    status: RunStatus,
    error: Option<&str>,
) {
    match pipeline_runs::finish_run(pool, run_id, status, error).await {
        Ok(0) => {}
        Ok(_) => {
            let event = match status {
                RunStatus::Cancelled => OrchestrationEvent::RunCancelled { run_id },
                RunStatus::Timeout => OrchestrationEvent::RunTimeout { run_id },
                RunStatus::Completed => OrchestrationEvent::RunCompleted { run_id },
                _ => OrchestrationEvent::RunFailed {
                    run_id,
                    error: error.unwrap_or("unknown error").to_string(),
                },
            };
            events::emit(events, event);
        }
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "failed to write terminal run status");
        }
    }
}
