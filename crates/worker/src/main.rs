use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use dbworker_infra::QueueConfig;
use dbworker_infra::backend::PostgresDatabase;
use dbworker_observability::MetricsRegistry;
use dbworker_worker::{Services, prepare_postgres};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dbworker_observability::init();

    let config = QueueConfig::from_env()?;
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
        tracing::warn!("DATABASE_URL not set; using local dev default");
        "postgres://postgres@localhost:5432/dbworker".to_string()
    });

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let db = Arc::new(PostgresDatabase::new(pool));
    prepare_postgres(&db).await?;

    let registry = Arc::new(MetricsRegistry::new());
    let services = Services::start(db, &config, Arc::clone(&registry))?;
    services.refresh_gauges().await;
    tracing::info!(worker = %config.name, "dbworker running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested; waiting for resetters");

    // A second signal forces exit.
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("second shutdown signal; exiting immediately");
            std::process::exit(1);
        }
    });

    services.refresh_gauges().await;
    for (queue, stats) in services.shutdown().await {
        tracing::info!(
            queue,
            cycles = stats.cycles,
            reset = stats.records_reset,
            errored = stats.records_errored,
            errors = stats.reset_errors,
            "resetter stopped"
        );
    }

    match registry.snapshot().to_json() {
        Ok(json) => tracing::info!(metrics = %json, "final metrics"),
        Err(err) => tracing::warn!(error = %err, "failed to encode final metrics"),
    }
    Ok(())
}
