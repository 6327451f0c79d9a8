//! Worker node: Postgres storage, built-in handlers, runs until Ctrl-C.
//!
//! Environment:
//! - `DATABASE_URL` (required)
//! - `REDIS_URL` (required when `JOBFORGE_MESSAGE_QUEUE_MODE=true`)
//! - `JOBFORGE_STATS_INTERVAL_MS` (default 60000)
//! - every `JOBFORGE_*` scheduler variable read by `SchedulerConfig::from_env`

mod engine;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use jobforge_infra::{PostgresJobStore, PostgresScopeLocks, RedisJobBroker};
use jobforge_jobs::{register_builtin_handlers, HandlerRegistry, JobScheduler, SchedulerConfig};

use crate::engine::LoggingEngine;

fn stats_interval() -> anyhow::Result<Duration> {
    match std::env::var("JOBFORGE_STATS_INTERVAL_MS") {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("JOBFORGE_STATS_INTERVAL_MS is not a number: {raw}"))?;
            Ok(Duration::from_millis(ms.max(1000)))
        }
        Err(_) => Ok(Duration::from_secs(60)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobforge_observability::init();

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let stats_every = stats_interval()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pool_size as u32 + 4)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;

    let store = PostgresJobStore::from_current(pool.clone())?;
    store.migrate().await.context("failed to apply job migrations")?;
    let scope_locks = PostgresScopeLocks::from_current(pool)?;

    let mut handlers = HandlerRegistry::new();
    register_builtin_handlers(&mut handlers, Arc::new(LoggingEngine));
    tracing::info!(handlers = ?handlers.registered_types(), "handlers registered");

    let mut builder = JobScheduler::builder(config.clone(), Arc::new(store))
        .scope_locks(Arc::new(scope_locks))
        .handlers(handlers);
    if config.message_queue_mode {
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL must be set in message queue mode")?;
        let broker = RedisJobBroker::new(&redis_url, std::env::var("JOBFORGE_REDIS_QUEUE").ok())?;
        builder = builder.broker(Arc::new(broker));
    }
    let scheduler = Arc::new(builder.build()?);

    scheduler.start()?;
    tracing::info!(owner = %scheduler.owner(), "node running, press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(stats_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = ticker.tick() => {
                let scheduler = Arc::clone(&scheduler);
                match tokio::task::spawn_blocking(move || scheduler.stats()).await? {
                    Ok(stats) => tracing::info!(
                        stats = %serde_json::to_string(&stats).unwrap_or_default(),
                        "scheduler stats"
                    ),
                    Err(err) => tracing::warn!(error = %err, "failed to read scheduler stats"),
                }
            }
        }
    }

    tracing::info!("shutting down");
    let stopping = Arc::clone(&scheduler);
    let report = tokio::task::spawn_blocking(move || stopping.shutdown()).await??;
    tracing::info!(
        completed_in_time = report.completed_in_time,
        abandoned = report.abandoned,
        released = report.released,
        "node stopped"
    );
    Ok(())
}
