//! Background runner entry point.
//!
//! Hosts the infrastructure loops that keep the saga machinery moving:
//! the outbox publisher, the outbox retention sweep, and stalled saga
//! detection. Compensation consumers are embedded in the services that
//! own the state being undone and are not hosted here.

mod config;

use std::sync::Arc;
use std::time::Duration;

use config::Config;
use outbox::{InProcessBus, OutboxPublisher, PostgresOutboxStore};
use saga::{PostgresSagaStore, StalledSagaSweep};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Terminal outbox rows are purged on this cadence.
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Resolves when the shutdown flag flips.
async fn wait_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.changed().await;
}

async fn apply_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(include_str!("../../../migrations/001_create_saga_tables.sql"))
        .execute(pool)
        .await?;
    sqlx::raw_sql(include_str!("../../../migrations/002_create_outbox_table.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder with its scrape endpoint
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .expect("failed to install Prometheus recorder");

    // 3. Connect and ensure the schema exists
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    apply_migrations(&pool).await.expect("failed to apply migrations");

    let outbox_store = PostgresOutboxStore::new(pool.clone());
    let saga_store = PostgresSagaStore::new(pool);

    // In-process transport for single-process deployments; embedded
    // consumers subscribe through this bus. Multi-process deployments
    // swap in a broker-backed EventBus implementation.
    let bus = InProcessBus::default();

    let publisher = Arc::new(OutboxPublisher::new(
        outbox_store,
        bus,
        config.publisher_config(),
    ));
    let sweep = StalledSagaSweep::new(saga_store, config.stall_after, config.sweep_interval);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tracing::info!(
        metrics_port = config.metrics_port,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        "runner starting"
    );

    let publish_task = tokio::spawn({
        let publisher = publisher.clone();
        let rx = shutdown_rx.clone();
        async move { publisher.run(wait_shutdown(rx)).await }
    });

    let retention_task = tokio::spawn({
        let publisher = publisher.clone();
        let mut rx = shutdown_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = publisher.sweep().await {
                            tracing::error!(error = %e, "outbox retention sweep failed");
                        }
                    }
                    _ = rx.changed() => return,
                }
            }
        }
    });

    let sweep_task = tokio::spawn({
        let rx = shutdown_rx.clone();
        async move { sweep.run(wait_shutdown(rx)).await }
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(publish_task, retention_task, sweep_task);
    tracing::info!("runner shut down gracefully");
}
