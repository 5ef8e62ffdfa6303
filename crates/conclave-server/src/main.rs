mod serve_cmd;

use clap::{Parser, Subcommand};

use conclave_db::config::DbConfig;
use conclave_db::pool;

#[derive(Parser)]
#[command(name = "conclave", about = "Multi-agent collaboration server")]
struct Cli {
    /// Database URL (overrides CONCLAVE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the conclave database (if needed) and run migrations
    DbInit,
    /// Run the orchestration server: scheduler, run manager, readiness probe
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Listen port
        #[arg(long, default_value_t = 8700)]
        port: u16,
    },
}

/// Execute `conclave db-init`: create database and run migrations.
async fn cmd_db_init(db_config: &DbConfig) -> anyhow::Result<()> {
    println!("Initializing conclave database...");

    pool::ensure_database_exists(db_config).await?;

    let db_pool = pool::create_pool(db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("conclave db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db_config = DbConfig::resolve(cli.database_url.as_deref());

    match cli.command {
        Commands::DbInit => {
            cmd_db_init(&db_config).await?;
        }
        Commands::Serve { bind, port } => {
            let db_pool = pool::create_pool(&db_config).await?;
            serve_cmd::run_serve(db_pool, &bind, port).await?;
        }
    }

    Ok(())
}
