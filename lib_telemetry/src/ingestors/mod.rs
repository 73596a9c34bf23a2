//! # Data Ingestors Module
//!
//! The producer side of the pipeline. The [`poller::Poller`] is a ticker-driven
//! REST ingestor: every interval it fetches the configured bounding box,
//! normalizes the records into telemetry events and publishes them onto the
//! outbound topic one by one, keyed by ICAO24.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Ticker-driven OpenSky poller with retry and escalation.
pub mod poller;

// --- Public API Re-exports ---
pub use poller::{CycleReport, Poller, PollerSettings};
