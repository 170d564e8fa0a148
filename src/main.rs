//! Courier webhook delivery service.
//!
//! Connects to PostgreSQL, ensures the schema exists, starts the delivery
//! engine and runs until Ctrl+C or SIGTERM.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::Storage, Clock, RealClock};
use courier_delivery::{shared_store::SharedStore, storage::PostgresDeliveryStorage, DeliveryEngine};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        worker_pool_size = config.worker_pool_size,
        shared_store = if config.redis_url.is_some() { "redis" } else { "memory" },
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(db_pool.clone()))));
    let store = create_shared_store(&config, clock.clone()).await?;

    let mut engine = DeliveryEngine::new(storage, store, config.to_delivery_config(), clock)
        .context("failed to build delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;
    info!("courier is delivering webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight deliveries");

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "delivery engine did not shut down cleanly");
    }

    db_pool.close().await;
    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info,courier=debug"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
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
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

#[cfg(feature = "redis")]
async fn create_shared_store(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn SharedStore>> {
    use courier_delivery::shared_store::{redis::RedisSharedStore, InMemorySharedStore};

    match &config.redis_url {
        Some(url) => {
            let store = RedisSharedStore::connect(url).await.context("failed to connect to redis")?;
            Ok(Arc::new(store))
        },
        None => Ok(Arc::new(InMemorySharedStore::new(clock))),
    }
}

#[cfg(not(feature = "redis"))]
async fn create_shared_store(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn SharedStore>> {
    use courier_delivery::shared_store::InMemorySharedStore;

    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but courier was built without the redis feature, using in-memory store");
    }
    Ok(Arc::new(InMemorySharedStore::new(clock)))
}

/// Creates the schema if it does not exist.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id UUID PRIMARY KEY,
            url TEXT NOT NULL,
            signing JSONB NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT true,
            event_patterns JSONB NOT NULL DEFAULT '["*"]',
            filter JSONB,
            template TEXT,
            excluded_fields JSONB NOT NULL DEFAULT '[]',
            rate_limit JSONB,
            max_retries INTEGER NOT NULL DEFAULT 5 CHECK (max_retries > 0),
            batch JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create subscriptions table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS deliveries (
            id UUID PRIMARY KEY,
            subscription_id UUID NOT NULL,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'success', 'failed')),
            attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
            next_retry_at TIMESTAMPTZ,
            idempotency_key TEXT,
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create deliveries table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            delivery_id UUID NOT NULL REFERENCES deliveries(id),
            attempt_number INTEGER NOT NULL CHECK (attempt_number > 0),
            outcome TEXT NOT NULL,
            http_status INTEGER,
            duration_ms BIGINT NOT NULL,
            error TEXT,
            attempted_at TIMESTAMPTZ NOT NULL,
            UNIQUE (delivery_id, attempt_number)
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create delivery_attempts table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id UUID PRIMARY KEY,
            delivery_id UUID NOT NULL UNIQUE REFERENCES deliveries(id),
            subscription_id UUID NOT NULL,
            event_type TEXT NOT NULL,
            payload JSONB NOT NULL,
            error TEXT NOT NULL,
            retry_count INTEGER NOT NULL,
            stored_at TIMESTAMPTZ NOT NULL,
            replayed_at TIMESTAMPTZ,
            archived BOOLEAN NOT NULL DEFAULT false
        )
        ",
    )
    .execute(pool)
    .await
    .context("failed to create dead_letters table")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_deliveries_due
        ON deliveries(status, next_retry_at)
        WHERE status = 'pending'
        ",
    )
    .execute(pool)
    .await
    .context("failed to create deliveries due index")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_dead_letters_subscription
        ON dead_letters(subscription_id, stored_at DESC)
        ",
    )
    .execute(pool)
    .await
    .context("failed to create dead_letters subscription index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C signal"),
        () = terminate => info!("received SIGTERM signal"),
    }
}
