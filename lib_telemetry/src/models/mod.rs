//! # Data Model
//!
//! The value types that flow through the pipeline, leaf-first:
//!
//! - **`credentials`**: OAuth2 client credentials and the access token state.
//! - **`state`**: [`StateRecord`], the strongly-typed upstream observation with
//!   its nullability intact.
//! - **`event`**: [`TelemetryEvent`], the null-free projection used on the wire
//!   and in storage, plus [`StorageRow`] and the [`Batch`] alias.
//!
//! Events are immutable once published: every downstream stage works on
//! copies or on shared `Arc<Batch>` snapshots.

/// OAuth2 client credentials and access token.
pub mod credentials;
/// Normalized telemetry events, batches and storage rows.
pub mod event;
/// Upstream state vector records.
pub mod state;

pub use credentials::{AccessToken, Credentials};
pub use event::{Batch, StorageRow, TelemetryEvent};
pub use state::StateRecord;
