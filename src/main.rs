//! meridian - FHIR R4 resource server entry point.

use anyhow::Context;
use clap::Parser;
use meridian::db::{PostgresStore, ResourceStore};
use meridian::hooks::TracingNotifier;
use meridian::search::SearchEngine;
use meridian::state::AppState;
use meridian::{api, config::Config, logging};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "fhir-server", about = "FHIR R4 resource server")]
struct Args {
    /// Path to a TOML configuration file (without extension).
    #[arg(long)]
    config: Option<String>,

    /// Overrides the configured listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Runs pending database migrations and exits without starting the server.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    if args.migrate_only {
        logging::init_simple_logging();
        let pool = connect(&config).await?;
        run_migrations(&pool).await?;
        tracing::info!("Migrations applied, exiting (--migrate-only)");
        return Ok(());
    }

    let _logging_guard = logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting meridian");

    let pool = connect(&config).await?;
    if config.database.run_migrations {
        run_migrations(&pool).await?;
    }

    let search = SearchEngine::new(pool.clone(), config.fhir.default_page_size, config.fhir.max_page_size);
    let store: Arc<dyn ResourceStore> = Arc::new(PostgresStore::new(
        pool,
        search.clone(),
        Arc::new(TracingNotifier),
        config.fhir.auto_link_observations,
    ));

    let state = AppState::new(store, Arc::new(search), Arc::new(config.clone()));
    let app = api::create_router(state);

    let addr = config.socket_addr().context("Invalid listen address")?;
    tracing::info!(listen_addr = %addr, "meridian listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated unexpectedly")?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<sqlx::PgPool> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .with_context(|| format!("failed to connect to {}", config.database.url))
}

async fn run_migrations(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await.context("failed to run migrations")
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let sigint = tokio::signal::ctrl_c();

    tokio::select! {
        _ = sigint => tracing::info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received");
}
