//! Courier webhook delivery service.
//!
//! Connects to PostgreSQL, makes sure the schema exists and runs the
//! delivery engine until Ctrl-C or SIGTERM.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::storage::{schema, Storage};
use courier_delivery::{
    queue::PostgresWorkQueue,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    DeliveryEngine, WorkQueue,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::Config;

const CONNECT_MAX_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        worker_count = config.worker_count,
        queue = %config.queue_name,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    schema::bootstrap(&pool).await.context("failed to bootstrap database schema")?;
    info!("database schema ready");

    let storage = Arc::new(Storage::new(pool.clone()));
    let queue: Arc<dyn WorkQueue> =
        Arc::new(PostgresWorkQueue::new(storage.pool(), config.to_queue_config()));
    let delivery_storage: Arc<dyn DeliveryStorage> =
        Arc::new(PostgresDeliveryStorage::new(storage));

    let mut engine = DeliveryEngine::new(delivery_storage, queue, config.to_delivery_config())
        .context("failed to create delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;

    info!("courier is delivering webhooks");

    shutdown_signal().await?;
    info!("shutdown signal received, starting graceful shutdown");

    let stats = engine.stats().await;
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "delivery engine did not shut down cleanly");
    }
    info!(
        processed = stats.messages_processed,
        delivered = stats.successful_deliveries,
        dead_lettered = stats.dead_lettered,
        "delivery engine stopped"
    );

    pool.close().await;
    info!("database connections closed");

    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured filter.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if retries < CONNECT_MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = CONNECT_MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to connect to database after retries");
            },
        }
    }
}

/// Waits for Ctrl-C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                info!("received Ctrl-C");
            },
            _ = terminate.recv() => {
                info!("received SIGTERM");
            },
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
        info!("received Ctrl-C");
    }

    Ok(())
}
