use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use storefront_durable::clock::SystemClock;
use storefront_durable::{PostgresRunStore, WorkflowEngine};
use storefront_worker::{
    init_tracing, registry, LogNotificationSink, NotificationSink, PgStorefrontStore,
    TelemetryConfig, WebhookNotificationSink, WorkerConfig, WorkflowDeps,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_tracing(&TelemetryConfig::from_env()).context("Failed to initialize tracing")?;

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        worker_id = %config.worker_id,
        max_concurrent = config.max_concurrent_runs,
        "storefront-worker starting..."
    );

    let pool = PgPoolOptions::new()
        .max_connections((config.max_concurrent_runs as u32).saturating_add(5))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let run_store = PostgresRunStore::new(pool.clone());
    run_store
        .migrate()
        .await
        .context("Failed to run workflow migrations")?;

    let notifier: Arc<dyn NotificationSink> = match &config.notify_webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "notifications delivered by webhook");
            Arc::new(WebhookNotificationSink::new(url.clone()).context("Invalid webhook sink")?)
        }
        None => {
            tracing::warn!("NOTIFY_WEBHOOK_URL not set, notifications are only logged");
            Arc::new(LogNotificationSink)
        }
    };

    let deps = WorkflowDeps {
        store: Arc::new(PgStorefrontStore::new(pool)),
        notifier,
        settings: config.workflow_settings(),
    };
    let registry = registry(&deps).context("Failed to register workflows")?;

    let engine = WorkflowEngine::new(
        Arc::new(run_store),
        Arc::new(registry),
        Arc::new(SystemClock),
        config.engine_config(),
    );
    engine.start().await.context("Failed to start workflow engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    engine.shutdown().await?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}
