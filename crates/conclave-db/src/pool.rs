use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Migrations embedded at compile time from `crates/conclave-db/migrations/`.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Pool sizing shared by every conclave process. Ten connections leave
/// headroom for the scheduler's lock-holding claim transactions next to
/// executor writes.
const MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the shared connection pool.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("could not open pool against {}", config.database_url))
}

/// Apply any embedded migrations the database has not seen yet.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("migration run failed")?;
    info!("migrations applied successfully");
    Ok(())
}

/// Create the configured database when it does not exist yet.
///
/// `CREATE DATABASE` cannot run inside the target database, so this opens
/// a single maintenance connection instead of a pool. The statement also
/// cannot take the name as a bind parameter, hence the identifier check
/// before interpolation.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let db_name = config
        .database_name()
        .context("database URL has no database name")?;
    if !is_safe_identifier(db_name) {
        bail!("refusing to create database with unsafe name {db_name:?}");
    }

    let maintenance_url = config.maintenance_url();
    let mut conn = PgConnection::connect(&maintenance_url)
        .await
        .with_context(|| {
            format!("could not reach maintenance database at {maintenance_url}")
        })?;

    let already: Option<i32> = sqlx::query_scalar("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(db_name)
        .fetch_optional(&mut conn)
        .await
        .context("pg_database lookup failed")?;

    if already.is_some() {
        info!(db = db_name, "database already exists");
    } else {
        conn.execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("CREATE DATABASE {db_name} failed"))?;
        info!(db = db_name, "database created");
    }

    conn.close().await.ok();
    Ok(())
}

/// Conservative identifier alphabet for names interpolated into DDL.
fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Row counts for every table in the `public` schema, for the `db-init`
/// summary.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' \
         ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .context("could not list public tables")?;

    let mut counts = Vec::with_capacity(tables.len());
    for table in tables {
        // Names straight out of pg_tables; interpolated, never user input.
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .with_context(|| format!("could not count rows in {table}"))?;
        counts.push((table, count));
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_check_accepts_snake_case() {
        assert!(is_safe_identifier("conclave"));
        assert!(is_safe_identifier("conclave_test_1"));
        assert!(is_safe_identifier("_private"));
    }

    #[test]
    fn identifier_check_rejects_injection_shapes() {
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("1starts_with_digit"));
        assert!(!is_safe_identifier("bad-name"));
        assert!(!is_safe_identifier("x; DROP TABLE pipelines"));
        assert!(!is_safe_identifier("name with spaces"));
    }
}
