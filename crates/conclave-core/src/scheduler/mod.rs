//! Scheduler loop: advances active scheduled actions to their next run and
//! dispatches due ones.
//!
//! Two serial gates prevent duplicate dispatch. Within one instance a
//! process-local `running_actions` set is flagged *before* any task is
//! spawned; across instances the advisory lock on `(namespace, action_id)`
//! linearizes claims. Both are mandatory.

pub mod actions;

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conclave_db::advisory;
use conclave_db::models::{ActionRunStatus, ScheduleKind, ScheduledAction, TriggeredBy};
use conclave_db::queries::{action_runs, actions as action_db};

use crate::config::CoreConfig;

use self::actions::{ActionDispatcher, ActionOutcome};

/// Clock-skew allowance for the recovery deduplication window, in seconds.
///
/// A run triggered up to this long before the missed `next_run_at` still
/// counts as a claim on that window.
const RECOVERY_SKEW_S: i64 = 60;

/// The background scheduler for one process.
pub struct Scheduler {
    pool: PgPool,
    dispatcher: Arc<ActionDispatcher>,
    running_actions: Arc<Mutex<HashSet<i32>>>,
    check_interval: Duration,
    jitter: Duration,
    lock_namespace: i32,
    stop: CancellationToken,
}

impl Scheduler {
    pub fn new(pool: PgPool, dispatcher: Arc<ActionDispatcher>, config: &CoreConfig) -> Self {
        Self {
            pool,
            dispatcher,
            running_actions: Arc::new(Mutex::new(HashSet::new())),
            check_interval: config.scheduler_check_interval,
            jitter: config.scheduler_jitter,
            lock_namespace: config.advisory_lock_namespace,
            stop: CancellationToken::new(),
        }
    }

    /// Token that stops the loop after its current tick.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Actions currently flagged as running in this instance.
    pub fn running_actions(&self) -> Vec<i32> {
        self.running_actions
            .lock()
            .expect("running set poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Run the loop until stopped: startup recovery, then periodic ticks
    /// with jitter so a fleet of instances does not align.
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.recover_missed().await {
            warn!(error = %format!("{e:#}"), "startup recovery failed");
        }

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            // A panicking tick must not take the loop down.
            match AssertUnwindSafe(self.tick()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %format!("{e:#}"), "scheduler tick failed"),
                Err(_) => error!("scheduler tick panicked"),
            }

            let jitter_s = self.jitter.as_secs();
            let jitter = if jitter_s == 0 {
                Duration::ZERO
            } else {
                Duration::from_secs(rand::rng().random_range(0..=jitter_s))
            };

            tokio::select! {
                _ = tokio::time::sleep(self.check_interval + jitter) => {}
                _ = self.stop.cancelled() => break,
            }
        }

        info!("scheduler loop stopped");
    }

    /// One scan: load due active actions and spawn a claim task for each.
    pub async fn tick(&self) -> Result<()> {
        let due = action_db::list_due_actions(&self.pool, Utc::now()).await?;
        debug!(due = due.len(), "scheduler tick");
        for action in due {
            self.maybe_spawn(action, TriggeredBy::Scheduler);
        }
        Ok(())
    }

    /// Crash recovery: before the first tick, resolve every missed window.
    ///
    /// An action whose `next_run_at` is in the past either already has a
    /// claim recorded inside the skew-padded window (advance only) or gets
    /// exactly one recovery dispatch, still gated by the advisory lock. A
    /// failing dedup query fails closed: the action is left untouched for
    /// the normal tick path.
    pub async fn recover_missed(&self) -> Result<()> {
        let now = Utc::now();
        let missed = action_db::list_due_actions(&self.pool, now).await?;

        for action in missed {
            let Some(expected_at) = action.next_run_at else {
                continue;
            };
            let window_start = expected_at - chrono::Duration::seconds(RECOVERY_SKEW_S);

            match action_runs::run_exists_in_window(&self.pool, action.id, window_start).await {
                Ok(true) => {
                    info!(
                        action_id = action.id,
                        "missed window already claimed, advancing without executing"
                    );
                    match next_occurrence(&action, now) {
                        Ok((next, expire)) => {
                            if let Err(e) = action_db::advance_next_run_only(
                                &self.pool, action.id, next, expire,
                            )
                            .await
                            {
                                warn!(action_id = action.id, error = %e, "failed to advance action");
                            }
                        }
                        Err(e) => {
                            warn!(action_id = action.id, error = %e, "cannot compute next occurrence")
                        }
                    }
                }
                Ok(false) => {
                    info!(action_id = action.id, "dispatching recovery run for missed window");
                    self.maybe_spawn(action, TriggeredBy::Recovery);
                }
                Err(e) => {
                    warn!(
                        action_id = action.id,
                        error = %format!("{e:#}"),
                        "recovery dedup check failed, leaving action to the normal tick"
                    );
                }
            }
        }

        Ok(())
    }

    /// Flag-then-spawn critical section.
    ///
    /// The flag insert happens before the spawn so another tick can never
    /// observe the action as idle while its claim task is being set up.
    fn maybe_spawn(&self, action: ScheduledAction, triggered_by: TriggeredBy) {
        {
            let mut running = self.running_actions.lock().expect("running set poisoned");
            if running.contains(&action.id) && !action.allow_concurrent {
                debug!(action_id = action.id, "action already running in this instance");
                return;
            }
            running.insert(action.id);
        }

        let pool = self.pool.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let running = Arc::clone(&self.running_actions);
        let namespace = self.lock_namespace;
        tokio::spawn(async move {
            match claim_action(&pool, namespace, &dispatcher, &action, triggered_by).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(action_id = action.id, "claim lost to another instance");
                }
                Err(e) => {
                    warn!(
                        action_id = action.id,
                        error = %format!("{e:#}"),
                        "action claim failed"
                    );
                }
            }
            running
                .lock()
                .expect("running set poisoned")
                .remove(&action.id);
        });
    }

    /// Claim and execute one action on this instance.
    ///
    /// Returns `false` when another instance holds the advisory lock.
    pub async fn claim(
        &self,
        action: &ScheduledAction,
        triggered_by: TriggeredBy,
    ) -> Result<bool> {
        claim_action(
            &self.pool,
            self.lock_namespace,
            &self.dispatcher,
            action,
            triggered_by,
        )
        .await
    }
}

/// Claim and execute one action.
///
/// The claim transaction holds the advisory lock for the whole dispatch;
/// the run row, the action advance, and the outcome all commit (and the
/// lock releases) together.
async fn claim_action(
    pool: &PgPool,
    namespace: i32,
    dispatcher: &ActionDispatcher,
    action: &ScheduledAction,
    triggered_by: TriggeredBy,
) -> Result<bool> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to open claim transaction")?;

    if !advisory::try_acquire(&mut tx, namespace, action.id).await {
        return Ok(false);
    }

    let triggered_at = Utc::now();
    let run_row =
        action_runs::insert_action_run(&mut tx, action.id, triggered_at, triggered_by).await?;

    let timeout = Duration::from_secs(action.timeout_s.max(1) as u64);
    let outcome = match tokio::time::timeout(timeout, dispatcher.dispatch(action)).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => ActionOutcome {
            status: ActionRunStatus::Timeout,
            summary: "action dispatch timed out".to_string(),
            error: Some(format!("exceeded {}s", action.timeout_s)),
        },
    };

    info!(
        action_id = action.id,
        kind = %action.kind,
        triggered_by = %triggered_by,
        status = %outcome.status,
        summary = %outcome.summary,
        "action dispatched"
    );

    let (next_run_at, expire) = next_occurrence(action, Utc::now())?;
    action_db::advance_action(
        &mut tx,
        action.id,
        &outcome.status.to_string(),
        next_run_at,
        expire,
    )
    .await?;
    action_runs::finish_action_run(&mut tx, run_row, outcome.status, outcome.error.as_deref())
        .await?;

    tx.commit().await.context("failed to commit claim transaction")?;
    Ok(true)
}

/// Compute the next firing time for an action after a claimed run.
///
/// Returns `(next_run_at, expire)`: cron advances to the next occurrence,
/// interval to `now + interval`, once clears and expires, and event-driven
/// actions never advance automatically.
pub fn next_occurrence(
    action: &ScheduledAction,
    now: DateTime<Utc>,
) -> Result<(Option<DateTime<Utc>>, bool)> {
    match action.schedule_kind {
        ScheduleKind::Cron => {
            let expr = action
                .cron_expression
                .as_deref()
                .ok_or_else(|| anyhow!("cron action {} has no cron_expression", action.id))?;
            let schedule = cron::Schedule::from_str(expr)
                .with_context(|| format!("invalid cron expression {expr:?}"))?;
            Ok((schedule.after(&now).next(), false))
        }
        ScheduleKind::Interval => {
            let secs = action
                .interval_s
                .ok_or_else(|| anyhow!("interval action {} has no interval", action.id))?;
            Ok((Some(now + chrono::Duration::seconds(secs.max(1))), false))
        }
        ScheduleKind::Once => Ok((None, true)),
        ScheduleKind::Event => Ok((None, false)),
    }
}
