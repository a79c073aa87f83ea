//! Loglake server binary entry point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use loglake::clock::{Clock, SystemClock};
use loglake::ingest::EntryObserver;
use loglake::notify::{AlertManager, WebhookNotifier};
use loglake::server::{AppState, CliArgs, LogServer, Metrics};
use loglake::storage::RetentionSweeper;
use loglake::{ChunkReader, ChunkWriter, Executor, Ingestor, LabelIndex, TailHub};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI arguments
    let args = CliArgs::parse();
    let config = match args.to_config() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("Invalid configuration: {}", err);
            std::process::exit(1);
        }
    };

    tracing::info!("Starting loglake with config: {:?}", config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let index = Arc::new(LabelIndex::new());
    let reader = Arc::new(ChunkReader::new(&config.storage.path));

    // Restore the index from chunk sidecars left by previous runs.
    let summary = match reader.rebuild_index(&index).await {
        Ok(summary) => {
            if summary.chunks > 0 {
                tracing::info!(
                    "restored {} chunks from disk ({} reconciled without sidecar)",
                    summary.chunks,
                    summary.reconciled
                );
            }
            summary
        }
        Err(err) => {
            tracing::warn!("index rebuild failed, starting empty: {}", err);
            Default::default()
        }
    };

    let writer = Arc::new(ChunkWriter::with_sequence(
        &config.storage.path,
        clock.clone(),
        summary.last_sequence,
    ));

    // Live-tail hub plus optional webhook observer.
    let hub = Arc::new(TailHub::new());
    let mut observers: Vec<Arc<dyn EntryObserver>> = vec![hub.clone()];
    let notifier = match &args.webhook_config {
        Some(path) => match WebhookNotifier::load(path).await {
            Ok(webhooks) => {
                let notifier = Arc::new(WebhookNotifier::new(webhooks));
                observers.push(notifier.clone());
                Some(notifier)
            }
            Err(err) => {
                tracing::error!("Failed to load webhook config: {}", err);
                std::process::exit(1);
            }
        },
        None => None,
    };

    let ingestor = Arc::new(Ingestor::new(
        config.ingest.clone(),
        config.storage.chunk_size_bytes,
        index.clone(),
        writer.clone(),
        observers,
        clock.clone(),
    ));
    ingestor.start().await;

    let executor = Arc::new(Executor::new(index.clone(), reader.clone()));

    // Background tasks: broadcast loop and retention sweeper.
    let hub_runner = hub.clone();
    tokio::spawn(async move { hub_runner.run().await });

    let sweeper = RetentionSweeper::new(
        &config.storage.path,
        config.storage.retention_days,
        config.storage.retention_interval,
        index.clone(),
        clock.clone(),
    );
    tokio::spawn(sweeper.run());

    if let Some(path) = &args.alert_config {
        match AlertManager::load(path).await {
            Ok(rules) => {
                let notifier =
                    notifier.unwrap_or_else(|| Arc::new(WebhookNotifier::new(Vec::new())));
                let manager = Arc::new(AlertManager::new(rules, notifier));
                tokio::spawn(manager.run(
                    executor.clone(),
                    clock.clone(),
                    Duration::from_secs(args.alert_interval_secs),
                ));
            }
            Err(err) => {
                tracing::error!("Failed to load alert config: {}", err);
                std::process::exit(1);
            }
        }
    }

    let state = AppState {
        ingestor,
        executor,
        index,
        writer,
        hub,
        metrics: Arc::new(Metrics::new()),
        started_at: Instant::now(),
    };

    let server = LogServer::new(state, args.server_config());
    if let Err(err) = server.run().await {
        tracing::error!("Server error: {}", err);
        std::process::exit(1);
    }
}
