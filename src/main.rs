//! KASIMA engine entry point.
//!
//! Builds every capability (stores, gateway, chat source, telemetry) once,
//! hands them to the stage managers, and runs the managers as independent
//! cooperative tasks until a shutdown signal arrives. Loops exit at their
//! next suspension point; in-flight exchange calls are awaited, never
//! aborted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kasima::application::entry::EntryEngine;
use kasima::application::hedge::HedgeReentryManager;
use kasima::application::ingestion::IngestionPipeline;
use kasima::application::lifecycle::LifecycleManager;
use kasima::application::maintenance::Maintenance;
use kasima::application::publisher::Publisher;
use kasima::application::watchdog::Watchdog;
use kasima::config::EngineConfig;
use kasima::infrastructure::bingx::BingxClient;
use kasima::infrastructure::exchange::ExchangeGateway;
use kasima::infrastructure::telegram::{ChatSource, TelegramSource};
use kasima::persistence::lifecycle_store::LifecycleStore;
use kasima::persistence::signal_store::SignalStore;
use kasima::persistence::telemetry::TelemetrySink;
use kasima::persistence::init_database;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kasima=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!(
        "KASIMA engine starting (trading={}, extract_only={}, channels={})",
        config.trading.enabled,
        config.trading.extract_only,
        config.telegram.source_channels.len()
    );

    let pool = init_database(&config.database_url).await?;
    let signal_store = SignalStore::new(pool.clone());
    let lifecycle_store = LifecycleStore::new(pool);

    let telemetry = Arc::new(TelemetrySink::new(&config.telemetry_path)?);

    let gateway: Arc<dyn ExchangeGateway> = Arc::new(BingxClient::new(config.bingx.clone())?);
    let chat: Arc<dyn ChatSource> = Arc::new(TelegramSource::new(config.telegram.clone())?);

    let publisher = Arc::new(Publisher::new(
        chat.clone(),
        config.telegram.destination_chat_id.clone(),
        config.telegram.operator_chat_id.clone(),
        telemetry.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Watchdog first so the capacity guard has an owner.
    let watchdog = Arc::new(Watchdog::new(
        signal_store.clone(),
        lifecycle_store.clone(),
        telemetry.clone(),
        config.watchdog.clone(),
    ));
    let capacity = watchdog.guard();
    tasks.push(tokio::spawn(watchdog.run(shutdown_rx.clone())));

    // Ingestion: one stream off the chat source, one pipeline task.
    let messages = chat
        .subscribe(&config.telegram.source_channels, shutdown_rx.clone())
        .await?;
    let ingestion = Arc::new(IngestionPipeline::new(
        signal_store.clone(),
        telemetry.clone(),
        config.dedup_ttl,
    ));
    tasks.push(tokio::spawn(
        ingestion.run(messages, shutdown_rx.clone()),
    ));

    // Entry worker pool.
    for worker in 0..config.trading.entry_workers.max(1) {
        let engine = Arc::new(EntryEngine::new(
            config.clone(),
            signal_store.clone(),
            lifecycle_store.clone(),
            gateway.clone(),
            publisher.clone(),
            telemetry.clone(),
            capacity.clone(),
            format!("entry-{}", worker),
        ));
        tasks.push(tokio::spawn(engine.run(shutdown_rx.clone())));
    }

    let lifecycle = Arc::new(LifecycleManager::new(
        config.clone(),
        signal_store.clone(),
        lifecycle_store.clone(),
        gateway.clone(),
        publisher.clone(),
        telemetry.clone(),
    ));
    tasks.push(tokio::spawn(lifecycle.run(shutdown_rx.clone())));

    let pyramid = Arc::new(kasima::application::pyramid::PyramidManager::new(
        config.clone(),
        lifecycle_store.clone(),
        gateway.clone(),
        telemetry.clone(),
    ));
    tasks.push(tokio::spawn(pyramid.run(shutdown_rx.clone())));

    // The hedge manager re-enters through its own entry engine instance.
    let reentry_engine = Arc::new(EntryEngine::new(
        config.clone(),
        signal_store.clone(),
        lifecycle_store.clone(),
        gateway.clone(),
        publisher.clone(),
        telemetry.clone(),
        capacity.clone(),
        "reentry".to_string(),
    ));
    let hedge = Arc::new(HedgeReentryManager::new(
        config.clone(),
        signal_store.clone(),
        lifecycle_store.clone(),
        gateway.clone(),
        reentry_engine,
        telemetry.clone(),
    ));
    tasks.push(tokio::spawn(hedge.run(shutdown_rx.clone())));

    let maintenance = Arc::new(Maintenance::new(
        config.clone(),
        signal_store,
        lifecycle_store,
        gateway,
        publisher,
        telemetry,
    ));
    tasks.push(tokio::spawn(maintenance.run(shutdown_rx.clone())));

    info!("All tasks started. Press Ctrl+C to stop.");

    shutdown_signal().await;
    info!("Shutdown signal received; stopping tasks...");
    if shutdown_tx.send(true).is_err() {
        warn!("All shutdown receivers already dropped");
    }

    // Loops exit at their next suspension point; give in-flight exchange
    // calls a bounded window to finish.
    let drain = async {
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Task ended abnormally: {}", e);
                }
            }
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("Tasks did not drain within 30s; exiting anyway");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
