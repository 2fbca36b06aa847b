use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_orchestrator::artifact::{ArtifactStore, MemoryArtifactStore, PgArtifactStore};
use gantry_orchestrator::executor::{PodmanEnvironment, StageExecutor};
use gantry_orchestrator::retention::RetentionSweeper;
use gantry_orchestrator::store::{MemoryStore, PgStore, RunStore};
use gantry_orchestrator::{Config, Orchestrator, api, db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Gantry Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let (store, artifacts): (Arc<dyn RunStore>, Arc<dyn ArtifactStore>) =
        match &config.database_url {
            Some(database_url) => {
                tracing::info!("Connecting to database...");
                let pool = db::create_pool(database_url)
                    .await
                    .context("Failed to create database pool")?;

                db::run_migrations(&pool)
                    .await
                    .context("Failed to run database migrations")?;
                tracing::info!("Database ready");

                (
                    Arc::new(PgStore::new(pool.clone())),
                    Arc::new(PgArtifactStore::new(pool)),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set, runs and artifacts are kept in memory");
                (
                    Arc::new(MemoryStore::new()),
                    Arc::new(MemoryArtifactStore::new()),
                )
            }
        };

    let environment = PodmanEnvironment::new(&config.workspace);
    if let Err(e) = environment.check_available() {
        tracing::warn!("{:#}; build and deploy stages will fail until podman is available", e);
    }

    let executor = StageExecutor::new(Arc::new(environment))
        .with_retry(config.retry)
        .with_stage_timeout(config.stage_timeout)
        .with_cancel_grace(config.cancel_grace);

    let orchestrator = Orchestrator::new(
        store.clone(),
        artifacts.clone(),
        executor,
        config.approver_grants(),
    );

    let resumed = orchestrator
        .resume()
        .await
        .context("Failed to resume unfinished runs")?;
    if resumed > 0 {
        tracing::info!("Resumed {} unfinished run(s)", resumed);
    }

    let shutdown = CancellationToken::new();
    let sweeper = RetentionSweeper::new(store, artifacts, config.retention, config.sweep_interval);
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.clone()));

    // Build router with all API endpoints
    let app = api::create_router(orchestrator);

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
            signal.cancel();
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    let _ = sweeper_task.await;

    Ok(())
}
