//! Shared PostgreSQL harness for conclave integration tests.
//!
//! One containerized server is shared per test binary; every test carves
//! out its own throwaway database, so suites run in parallel without
//! stepping on each other.
//!
//! Setting `CONCLAVE_TEST_PG_URL` points the harness at an already-running
//! server (e.g. one started by a nextest setup script) and skips the
//! container entirely.

use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use conclave_db::config::DbConfig;
use conclave_db::pool;

/// The server all test databases live on.
struct PgServer {
    url: String,
    /// Keeps the container alive for the lifetime of the test binary;
    /// `None` when an external server was supplied via the env var.
    _keepalive: Option<ContainerAsync<Postgres>>,
}

static SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn start_server() -> PgServer {
    if let Ok(url) = std::env::var("CONCLAVE_TEST_PG_URL") {
        return PgServer {
            url,
            _keepalive: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("postgres container should start");
    let host = container.get_host().await.expect("container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("mapped port for 5432");

    PgServer {
        url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _keepalive: Some(container),
    }
}

/// Root URL of the shared server, with no database path appended.
pub async fn pg_url() -> &'static str {
    &SERVER.get_or_init(start_server).await.url
}

/// One-off connection to the server's `postgres` maintenance database,
/// used for CREATE/DROP DATABASE.
async fn maintenance_conn() -> PgConnection {
    let url = format!("{}/postgres", pg_url().await);
    PgConnection::connect(&url)
        .await
        .expect("connect to maintenance database")
}

/// Create a fresh uniquely-named database, run migrations on it, and hand
/// back a pool plus the name to pass to [`drop_test_db`] afterwards.
pub async fn create_test_db() -> (PgPool, String) {
    let db_name = format!("conclave_{}", Uuid::new_v4().simple());

    let mut conn = maintenance_conn().await;
    conn.execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .unwrap_or_else(|e| panic!("CREATE DATABASE {db_name} failed: {e}"));
    conn.close().await.ok();

    let config = DbConfig::new(format!("{}/{}", pg_url().await, db_name));
    let test_pool = pool::create_pool(&config)
        .await
        .expect("pool on fresh test database");
    pool::run_migrations(&test_pool)
        .await
        .expect("migrations on fresh test database");

    (test_pool, db_name)
}

/// Drop a database created by [`create_test_db`].
///
/// Idempotent, and forgiving on purpose: stray connections are terminated
/// first so the drop cannot hang, and a database that is already gone is
/// not an error.
pub async fn drop_test_db(db_name: &str) {
    let mut conn = maintenance_conn().await;

    let _ = sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = $1 AND pid <> pg_backend_pid()",
    )
    .bind(db_name)
    .execute(&mut conn)
    .await;

    let _ = conn
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    conn.close().await.ok();
}
