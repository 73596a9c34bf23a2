//! # Batch Subscriber
//!
//! The consumer loop. It drains the inbound topic into an in-memory batch and
//! flushes whenever the topic goes quiet for one poll timeout or the batch
//! reaches its size limit.
//!
//! ## Flush order:
//! 1. **Broadcast hub** first, so live observers never lag behind storage.
//! 2. **Persistence coordinator** second. A store failure is logged and counted
//!    but never undoes or blocks the live delivery that already happened.
//!
//! Undecodable messages are dropped with a warning. On cancellation the loop
//! stops polling, flushes what it holds and closes the topic.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::hub::HubHandle;
use super::persistence::PersistenceCoordinator;
use crate::error::TransportError;
use crate::models::{Batch, TelemetryEvent};
use crate::transport::{TopicConsumer, TOPIC_RAW};

/// # Subscriber Settings
#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    /// Inbound topic name.
    pub topic: String,
    /// How long one poll waits before the batch is considered complete.
    pub poll_timeout: Duration,
    /// Flush as soon as this many events are pending.
    pub max_batch_size: usize,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            topic: TOPIC_RAW.into(),
            poll_timeout: Duration::from_secs(5),
            max_batch_size: 1000,
        }
    }
}

/// Totals for one subscriber run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberReport {
    /// Messages decoded into events.
    pub events: u64,
    /// Messages dropped as undecodable.
    pub dropped: u64,
    /// Batches flushed.
    pub batches: u64,
    /// Batches the store rejected.
    pub store_failures: u64,
}

/// # Batch Subscriber
pub struct BatchSubscriber<C> {
    consumer: C,
    hub: HubHandle,
    persistence: PersistenceCoordinator,
    settings: SubscriberSettings,
    report: SubscriberReport,
}

impl<C: TopicConsumer> BatchSubscriber<C> {
    /// Wires a consumer to both sinks.
    pub fn new(
        consumer: C,
        hub: HubHandle,
        persistence: PersistenceCoordinator,
        settings: SubscriberSettings,
    ) -> Self {
        Self {
            consumer,
            hub,
            persistence,
            settings,
            report: SubscriberReport::default(),
        }
    }

    /// Runs until cancelled or until the topic closes.
    ///
    /// Only a failed initial subscribe is returned as an error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SubscriberReport, TransportError> {
        self.consumer.subscribe(&self.settings.topic).await?;
        log::info!(
            "Subscribed to '{}' (poll timeout {:?}, max batch {})",
            self.settings.topic,
            self.settings.poll_timeout,
            self.settings.max_batch_size
        );

        let mut batch: Batch = Vec::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.consumer.poll(self.settings.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(message)) => match TelemetryEvent::from_payload(&message.payload) {
                    Ok(event) => {
                        self.report.events += 1;
                        batch.push(event);
                        if batch.len() >= self.settings.max_batch_size.max(1) {
                            self.flush(&mut batch).await;
                        }
                    }
                    Err(e) => {
                        self.report.dropped += 1;
                        log::warn!("Dropping undecodable message (key '{}'): {}", message.key, e);
                    }
                },
                Ok(None) => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                Err(TransportError::Closed) => {
                    log::info!("Topic '{}' closed.", self.settings.topic);
                    break;
                }
                Err(e) => {
                    log::warn!("Poll failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.settings.poll_timeout) => {}
                    }
                }
            }
        }

        // --- Shutdown: final flush, then release the topic ---
        if !batch.is_empty() {
            log::info!("Flushing {} pending events before shutdown.", batch.len());
            self.flush(&mut batch).await;
        }
        self.consumer.close().await;
        log::info!(
            "Batch subscriber stopped: events={} dropped={} batches={} store_failures={}",
            self.report.events,
            self.report.dropped,
            self.report.batches,
            self.report.store_failures
        );
        Ok(self.report)
    }

    async fn flush(&mut self, batch: &mut Batch) {
        let shared = Arc::new(std::mem::take(batch));
        self.report.batches += 1;

        self.hub.broadcast(shared.clone());

        if let Err(e) = self.persistence.insert_batch(&shared).await {
            self.report.store_failures += 1;
            log::error!("Failed to persist batch of {}: {}", shared.len(), e);
        }
    }
}
