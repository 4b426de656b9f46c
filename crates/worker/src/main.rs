//! Polling queue worker.
//!
//! Every tick it enqueues a queue health check per configured tenant (deduplicated
//! per minute) and drains one balanced batch. Stops on Ctrl-C.

mod settings;

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use caseflow_queue::clock::{Clock, SystemClock};
use caseflow_queue::jobs::{
    BatchOptions, HandlerRegistry, JobQueue, JobType, PostgresJobStore, ProcessOutcome, QueueEngine, WorkerId,
};
use caseflow_queue::ops::{
    HealthCheckService, PostgresOpsStore, QueueHealthCheckHandler, QueueingNotifier, StaticRecipients,
};

use settings::WorkerSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    caseflow_observability::init();

    let settings = WorkerSettings::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .context("failed to connect to Postgres")?;
    if settings.apply_schema {
        PostgresJobStore::apply_schema(&pool).await?;
    }
    let pool = Arc::new(pool);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let jobs = Arc::new(PostgresJobStore::from_arc(Arc::clone(&pool)));
    let ops = Arc::new(PostgresOpsStore::from_arc(Arc::clone(&pool)));
    let queue = JobQueue::new(jobs, Arc::clone(&clock));

    let health = Arc::new(
        HealthCheckService::new(
            queue.clone(),
            ops,
            Arc::new(QueueingNotifier::new(queue.clone())),
            Arc::new(StaticRecipients(settings.alert_recipients.clone())),
        )
        .with_thresholds(settings.thresholds)
        .with_lease_timeout(settings.queue.lease_timeout_chrono()),
    );

    // Email, webhook, cleanup and audit handlers are registered by the services that own them.
    let handlers = HandlerRegistry::new().with(
        JobType::QueueHealthCheck,
        QueueHealthCheckHandler::new(Arc::clone(&health)),
    );
    let engine = QueueEngine::new(queue, handlers, WorkerId::from_env(), settings.queue.clone());

    tracing::info!(
        worker_id = %engine.worker_id(),
        tenants = settings.tenant_ids.len(),
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        "queue worker started"
    );

    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received; stopping worker");
                break;
            }
            _ = ticker.tick() => {
                tick(&engine, &health, &settings, clock.as_ref()).await;
            }
        }
    }

    Ok(())
}

async fn tick(
    engine: &QueueEngine<PostgresJobStore>,
    health: &HealthCheckService<PostgresJobStore, PostgresOpsStore>,
    settings: &WorkerSettings,
    clock: &dyn Clock,
) {
    let now = clock.now();
    for tenant_id in &settings.tenant_ids {
        if let Err(e) = health.enqueue_queue_health_check(*tenant_id, now).await {
            tracing::warn!(tenant_id = %tenant_id, error = %e, "failed to enqueue queue health check");
        }
    }

    let opts = BatchOptions::new(settings.max_jobs, settings.time_budget);
    match engine.process_balanced_batch(opts).await {
        Ok(batch) if batch.processed > 0 => {
            let failed = batch
                .results
                .iter()
                .filter(|r| matches!(r, ProcessOutcome::Failed { .. }))
                .count();
            tracing::info!(processed = batch.processed, failed, per_type = ?batch.per_type_processed, "batch done");
        }
        Ok(_) => tracing::debug!("no eligible jobs"),
        // Store unavailable; try again next tick.
        Err(e) => tracing::error!(error = %e, "balanced batch failed"),
    }
}
