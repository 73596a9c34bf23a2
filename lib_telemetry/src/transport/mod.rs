//! # Topic Transport
//!
//! The contract between the producer process (poller) and the consumer process
//! (batch subscriber): an at-least-once, single-partition, keyed message channel.
//!
//! ## Core Design Principles:
//! 1. **Opaque payloads**: the transport moves `(key, bytes)` pairs and knows
//!    nothing about telemetry. Encoding lives in [`TelemetryEvent`](crate::TelemetryEvent).
//! 2. **Timeout is not an error**: [`TopicConsumer::poll`] returns `Ok(None)`
//!    when nothing arrived in time. That is the flush signal for the batch subscriber.
//! 3. **Pluggable backends**: [`memory::MemoryTopic`] for tests and single-process
//!    runs; the Redis Streams backend lives under `connections`.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{PublishError, TransportError};

/// In-process topic backed by a tokio channel.
pub mod memory;

/// Raw telemetry as published by the poller.
pub const TOPIC_RAW: &str = "telemetry.raw";

/// A keyed message as it travels over the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    /// Routing key. For telemetry this is the ICAO24 address.
    pub key: String,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

/// Write side of a topic.
#[async_trait]
pub trait TopicProducer: Send + Sync {
    /// Publishes one keyed message. Failures are per message.
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), PublishError>;
}

/// Read side of a topic.
#[async_trait]
pub trait TopicConsumer: Send {
    /// Attaches to `topic`. Must be called once before polling.
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the next message.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<TopicMessage>, TransportError>;

    /// Releases the subscription. Idempotent.
    async fn close(&mut self);
}
