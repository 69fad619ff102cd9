//! mdstore - market-data ingestion and storage backend.
//!
//! Wires the sqlite stores, validator, buffered writer, optional adaptive
//! processor, broker pipeline, subscription manager and recovery loop, then
//! runs until SIGINT/SIGTERM and shuts down with one final flush.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mdstore_backend::broker::registry::BrokerRegistry;
use mdstore_backend::config::AppConfig;
use mdstore_backend::pipeline::integration::{BrokerStorageIntegration, IngestSink};
use mdstore_backend::pipeline::DataPipeline;
use mdstore_backend::recovery::RecoveryService;
use mdstore_backend::storage::processor::DataProcessor;
use mdstore_backend::storage::service::StorageService;
use mdstore_backend::storage::sqlite::{SqliteMetadataStorage, SqliteTimeSeriesStorage};
use mdstore_backend::storage::{MetadataStorage, StorageManager, TimeSeriesStorage};
use mdstore_backend::subscription::InstrumentManager;
use mdstore_backend::validator::Validator;

#[derive(Debug, Parser)]
#[command(name = "mdstore", about = "Market-data ingestion and storage backend")]
struct Cli {
    /// Path to the TOML configuration file; defaults and environment
    /// overrides apply when omitted.
    #[arg(long, env = "MDSTORE_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::from_env(),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(db = %config.database.path, "mdstore starting");

    let db_path = config.database.path.as_str();
    let time_series: Arc<dyn TimeSeriesStorage> = if db_path == ":memory:" {
        Arc::new(SqliteTimeSeriesStorage::open_memory().context("open time-series store")?)
    } else {
        Arc::new(SqliteTimeSeriesStorage::open(db_path).context("open time-series store")?)
    };
    let metadata: Arc<dyn MetadataStorage> = if db_path == ":memory:" {
        Arc::new(SqliteMetadataStorage::open_memory().context("open metadata store")?)
    } else {
        Arc::new(SqliteMetadataStorage::open(db_path).context("open metadata store")?)
    };
    let storage = StorageManager::new(time_series, metadata);
    storage.health().await.context("storage health check")?;

    let validator = Arc::new(Validator::new(config.validator.clone()));

    // Deployment decision: ingest through the buffered writer, or through
    // the channel-fed adaptive processor.
    let (sink, service, processor) = if config.processor.enabled {
        let processor = DataProcessor::new(
            storage.time_series(),
            Arc::clone(&validator),
            config.processor.clone(),
        );
        processor.start();
        info!("ingesting through the adaptive data processor");
        (IngestSink::from(Arc::clone(&processor)), None, Some(processor))
    } else {
        let service = StorageService::new(
            storage.time_series(),
            Arc::clone(&validator),
            config.storage.clone(),
        );
        service.start();
        (IngestSink::from(Arc::clone(&service)), Some(service), None)
    };

    let registry = BrokerRegistry::new(config.broker.clone());
    let integration = BrokerStorageIntegration::new(sink, config.integration.clone());
    let pipeline = DataPipeline::new(
        Arc::clone(&registry),
        Arc::clone(&integration),
        config.pipeline.clone(),
    );

    // Register configured brokers first so the pipeline's auto-connect
    // (or the reconnect loop) picks them up.
    for broker_cfg in config.brokers.iter().filter(|b| b.enabled) {
        match registry.add(broker_cfg) {
            Ok(_) => info!(broker_id = %broker_cfg.id, "broker configured"),
            Err(err) => warn!(broker_id = %broker_cfg.id, error = %err, "broker rejected"),
        }
    }

    pipeline.start().await.context("start pipeline")?;

    let manager = InstrumentManager::new(
        storage.metadata(),
        Arc::clone(&pipeline),
        Arc::clone(&validator),
    );
    manager.start().await.context("load subscriptions")?;
    manager.resume_active().await.context("resume tracking")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recovery_handle = if config.recovery.enabled {
        let recovery = RecoveryService::new(
            storage.metadata(),
            storage.time_series(),
            Arc::clone(&registry),
            config.recovery.clone(),
        );
        Some(tokio::spawn(recovery.run_loop(shutdown_rx)))
    } else {
        None
    };

    wait_for_shutdown().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    pipeline.stop().await;
    if let Some(processor) = &processor {
        processor.close().await;
    }
    if let Some(service) = &service {
        let deadline = Duration::from_millis(config.shutdown.timeout_ms);
        if let Err(err) = service.close(deadline).await {
            error!(error = %err, "final flush failed");
        }
    }
    if let Some(handle) = recovery_handle {
        let _ = handle.await;
    }

    info!("mdstore stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
