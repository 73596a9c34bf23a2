//! # Core Engine Module
//!
//! The consumer-side heart of the pipeline:
//!
//! - **`batch_subscriber`**: drains the inbound topic into batches and flushes
//!   them to both sinks, live first.
//! - **`hub`**: the single-owner broadcast hub that fans batches out to live
//!   stream subscribers with non-blocking, drop-on-full delivery.
//! - **`persistence`**: the all-or-nothing, chunked batch writer and the
//!   [`TelemetryStore`] seam its backends implement.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Topic-draining consumer loop.
pub mod batch_subscriber;
/// Single-owner fan-out to live subscribers.
pub mod hub;
/// Transactional batch persistence.
pub mod persistence;

// --- Public API Re-exports ---
pub use batch_subscriber::{BatchSubscriber, SubscriberReport, SubscriberSettings};
pub use hub::{BroadcastHub, HubHandle, HubSettings, HubStats, SubscriberId, Subscription};
pub use persistence::{MemoryStore, PersistenceCoordinator, StoreTransaction, TelemetryStore};
