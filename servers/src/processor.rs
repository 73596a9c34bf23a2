//! # Processor
//!
//! Consumer process: drains the topic into batches and hands each batch to the
//! live broadcast hub (served over SSE) and to the durable store.
//!
//! With `--transport memory` the poller runs inside this process on an
//! in-memory topic, so a single binary covers the whole pipeline.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use lib_telemetry::connections::{PostgresStore, RedisConsumer};
use lib_telemetry::core::{
    BatchSubscriber, BroadcastHub, MemoryStore, PersistenceCoordinator, TelemetryStore,
};
use lib_telemetry::ingestors::Poller;
use lib_telemetry::transport::memory::MemoryTopic;
use servers::app_logic::config::{self, Config, StoreKind, TransportKind};
use servers::app_logic::{logger, stream, wiring};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let log_path = logger::setup_logging(&config.log_dir(), config.log_level(), "processor")?;
    log::info!("Processor booting (log file {}).", log_path.display());

    let transport = config.transport_kind()?;
    let persistence = PersistenceCoordinator::new(open_store(&config).await?, config.chunk_size());

    // --- Shared shutdown: hub, subscriber, poller and HTTP server ---
    let cancel = CancellationToken::new();
    wiring::cancel_on_signal(cancel.clone());

    let (hub, hub_task) = BroadcastHub::spawn(config.hub_settings(), cancel.clone());
    let server = tokio::spawn(stream::serve(hub.clone(), config.stream_settings(), cancel.clone()));

    let subscriber_settings = config.subscriber_settings();
    let outcome = match transport {
        TransportKind::Redis => {
            let consumer = RedisConsumer::new(config.redis_settings());
            BatchSubscriber::new(consumer, hub.clone(), persistence, subscriber_settings)
                .run(cancel.clone())
                .await
        }
        TransportKind::Memory => {
            let (producer, consumer) = MemoryTopic::open(config.topic());
            let poller = Poller::new(
                Arc::new(wiring::opensky_client(&config)?),
                Arc::new(producer),
                config.poller_settings(),
            );
            let poller_cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = poller.run(poller_cancel).await {
                    wiring::escalate(&e);
                }
            });
            BatchSubscriber::new(consumer, hub.clone(), persistence, subscriber_settings)
                .run(cancel.clone())
                .await
        }
    };

    // The subscriber may stop on its own (topic closed); take everything else down with it.
    cancel.cancel();

    match hub_task.await {
        Ok(stats) => log::info!(
            "Hub stopped: batches={} deliveries={} dropped={}",
            stats.batches_published,
            stats.deliveries,
            stats.deliveries_dropped
        ),
        Err(e) => log::error!("Hub task failed: {}", e),
    }
    match server.await {
        Ok(Err(e)) => log::error!("{:#}", e),
        Err(e) => log::error!("Live stream server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    let report = outcome.context("batch subscriber failed to start")?;
    log::info!(
        "Shutdown complete: events={} batches={} store_failures={}",
        report.events,
        report.batches,
        report.store_failures
    );
    Ok(())
}

async fn open_store(config: &Config) -> Result<Option<Arc<dyn TelemetryStore>>> {
    match config.store_kind()? {
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required with --store postgres")?;
            let store = PostgresStore::connect(url, config.db_max_connections.unwrap_or(8))
                .await
                .context("cannot open the PostgreSQL store")?;
            Ok(Some(Arc::new(store)))
        }
        StoreKind::Memory => {
            log::warn!("Using the in-memory store; nothing survives a restart.");
            Ok(Some(Arc::new(MemoryStore::new())))
        }
        StoreKind::None => {
            log::warn!("No durable store configured; batches are streamed live only.");
            Ok(None)
        }
    }
}
