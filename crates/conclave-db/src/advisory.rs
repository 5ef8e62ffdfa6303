//! Transaction-scoped advisory locks for multi-instance coordination.
//!
//! PostgreSQL's `pg_try_advisory_xact_lock(int, int)` is a non-blocking,
//! cooperative mutex keyed by an `(namespace, resource)` integer pair. The
//! lock auto-releases when the enclosing transaction commits or rolls back,
//! so a crashed holder never leaves the key stuck.

use sqlx::{Postgres, Transaction};
use tracing::warn;

/// Namespace reserved for scheduler action claims.
///
/// Keeping the scheduler in its own namespace means any other advisory-lock
/// use of the database cannot collide with action ids.
pub const SCHEDULER_LOCK_NAMESPACE: i32 = 1;

/// Try to acquire the advisory lock for `(namespace, resource)` on the given
/// transaction.
///
/// Non-blocking: returns `true` iff this transaction now holds the lock.
/// The lock is released automatically at transaction end.
///
/// Fails **closed**: any error from the store is logged and reported as
/// `false`. A caller must never act on an uncertain acquisition.
pub async fn try_acquire(
    tx: &mut Transaction<'_, Postgres>,
    namespace: i32,
    resource: i32,
) -> bool {
    let result: Result<bool, sqlx::Error> =
        sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1::int, $2::int)")
            .bind(namespace)
            .bind(resource)
            .fetch_one(&mut **tx)
            .await;

    match result {
        Ok(acquired) => acquired,
        Err(e) => {
            warn!(
                namespace,
                resource,
                error = %e,
                "advisory lock acquisition errored, treating as not acquired"
            );
            false
        }
    }
}
