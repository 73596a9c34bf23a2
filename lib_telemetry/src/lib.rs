//! # lib_telemetry
//!
//! The ingestion-and-fan-out engine behind the `skystream` collector and
//! processor binaries.
//!
//! Aircraft state vectors are pulled from the OpenSky REST API, normalized into
//! [`TelemetryEvent`]s and published onto a topic. On the consuming side a batch
//! subscriber drains the topic and hands every batch to two independent sinks:
//! the live [`core::hub::BroadcastHub`] and the transactional
//! [`core::persistence::PersistenceCoordinator`].
//!
//! ```text
//! Poller -> Topic -> BatchSubscriber -> { BroadcastHub, PersistenceCoordinator }
//! ```
//!
//! Modules are feature-gated by folder so thin tools can pull in only what they
//! need; `full` (the default) enables everything.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Typed error taxonomy shared by every stage of the pipeline.
pub mod error;
/// Credentials, upstream state records, telemetry events and storage rows.
pub mod models;
/// Topic publish/subscribe contract and the in-process topic.
pub mod transport;

/// OpenSky fetch client, token manager, positional decoder and retry executor.
#[cfg(feature = "retrieve")]
pub mod retrieve;

/// Producer-side polling loop.
#[cfg(feature = "ingestors")]
pub mod ingestors;

/// Broadcast hub, batch subscriber and persistence coordinator.
#[cfg(feature = "core")]
pub mod core;

/// Redis Streams and PostgreSQL backends.
#[cfg(feature = "connections")]
pub mod connections;

// --- Public API Re-exports ---
pub use error::{
    AuthError, CredentialsError, FetchError, PollerError, PublishError, StoreError, TransportError,
};
pub use models::{AccessToken, Batch, Credentials, StateRecord, StorageRow, TelemetryEvent};
