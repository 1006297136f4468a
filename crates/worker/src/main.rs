use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Notify;
use tracing::{info, warn};

use reportd_infra::config::Config;
use reportd_infra::producer::{ArtifactProducer, ReportWriter};
use reportd_infra::store::{PostgresReportStore, ReportStore};
use reportd_infra::worker::WorkerEngine;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    reportd_observability::init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    info!("running database migrations");
    reportd_infra::migrations::run(&pool).await?;

    let store: Arc<dyn ReportStore> = Arc::new(PostgresReportStore::new(pool.clone()));
    let producer: Arc<dyn ArtifactProducer> = Arc::new(ReportWriter::new());
    let engine = Arc::new(WorkerEngine::new(store, producer, config.worker.clone()));

    // Reclaim whatever a previous crash of any instance left behind.
    if let Err(e) = engine.recover_stale().await {
        warn!(error = %e, "startup stale-lease recovery failed");
    }

    let shutdown = Arc::new(Notify::new());
    let run = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown).await })
    };

    shutdown_signal().await;
    shutdown.notify_one();

    // The loop finishes its in-flight attempt before exiting; an attempt
    // abandoned by a hard kill is recovered by peers via stale leases.
    run.await?;

    pool.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
