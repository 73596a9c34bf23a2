//! # Collector
//!
//! Producer process: polls OpenSky on a fixed interval and appends every
//! aircraft state as one keyed message to the Redis stream topic.
//!
//! Exits 0 on SIGINT/SIGTERM and 1 when the poller escalates.

use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use lib_telemetry::connections::RedisProducer;
use lib_telemetry::ingestors::Poller;
use servers::app_logic::config::{self, TransportKind};
use servers::app_logic::{logger, wiring};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let log_path = logger::setup_logging(&config.log_dir(), config.log_level(), "collector")?;
    log::info!("Collector booting (log file {}).", log_path.display());

    if config.transport_kind()? == TransportKind::Memory {
        bail!("the memory transport cannot cross processes; run `processor --transport memory` instead");
    }

    let fetcher = Arc::new(wiring::opensky_client(&config)?);
    let producer = Arc::new(
        RedisProducer::connect(&config.redis_settings(), config.topic())
            .await
            .context("cannot connect the topic producer")?,
    );
    let poller = Poller::new(fetcher, producer, config.poller_settings());

    let cancel = CancellationToken::new();
    wiring::cancel_on_signal(cancel.clone());

    if let Err(e) = poller.run(cancel).await {
        wiring::escalate(&e);
    }

    log::info!("Shutdown complete.");
    Ok(())
}
