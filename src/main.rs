//! Courier webhook delivery service.
//!
//! Main entry point. Loads configuration, opens storage, starts the delivery
//! service and the HTTP API, and coordinates graceful shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{create_router, shutdown_signal, start_server, AppState, Config, StorageBackend};
use courier_core::{
    storage::{memory::InMemoryStorage, Storage},
    Backlog, Clock, Directory, HealthProbe, RealClock,
};
use courier_delivery::{DeliveryEngine, DeliveryService, Intake};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

/// Trait objects over whichever backend is configured.
struct Stores {
    directory: Arc<dyn Directory>,
    backlog: Arc<dyn Backlog>,
    health: Arc<dyn HealthProbe>,
    pool: Option<sqlx::PgPool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        storage_backend = ?config.storage_backend,
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        sweep_every_hours = config.sweep_every_hours,
        message_ttl_seconds = config.message_ttl_seconds,
        "starting courier"
    );

    let stores = open_storage(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let engine = DeliveryEngine::new(
        stores.directory.clone(),
        stores.backlog.clone(),
        config.to_delivery_config()?,
        clock.clone(),
    )
    .context("failed to create delivery engine")?;
    let service = DeliveryService::start(Arc::new(engine));

    let intake = Intake::new(
        stores.directory.clone(),
        stores.backlog.clone(),
        service.trigger_handle(),
        clock.clone(),
    );
    let app = create_router(AppState::new(intake, stores.health.clone(), clock), config.request_timeout());

    let addr = config.parse_server_addr()?;
    start_server(app, addr, shutdown_signal()).await.context("HTTP server failed")?;

    if let Err(e) = service.shutdown().await {
        warn!(error = %e, "delivery service did not stop cleanly");
    }

    if let Some(pool) = stores.pool {
        pool.close().await;
        info!("database connections closed");
    }

    info!("courier shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

async fn open_storage(config: &Config) -> Result<Stores> {
    match config.storage_backend {
        StorageBackend::Memory => {
            warn!("using in-memory storage, pending messages will not survive a restart");
            let storage = InMemoryStorage::new();
            Ok(Stores {
                directory: Arc::new(storage.clone()),
                backlog: Arc::new(storage.clone()),
                health: Arc::new(storage),
                pool: None,
            })
        },
        StorageBackend::Postgres => {
            let pool = create_database_pool(config).await?;
            info!("database connection pool established");

            let storage = Storage::new(pool.clone());
            storage.migrate().await.context("failed to run database migrations")?;

            Ok(Stores {
                directory: Arc::new(storage.clone()),
                backlog: Arc::new(storage.clone()),
                health: Arc::new(storage),
                pool: Some(pool),
            })
        },
    }
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
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
