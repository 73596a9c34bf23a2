//! # Data Retrieval Module
//!
//! Everything needed to pull state vectors out of the OpenSky REST API:
//!
//! - **`token`**: the OAuth2 token manager with double-checked refresh.
//! - **`opensky`**: the fetch client with 401/429 handling, behind the
//!   [`FetchStates`] seam so the poller can be driven by a fake in tests.
//! - **`decode`**: the positional array-of-arrays decoder.
//! - **`retry`**: the deterministic exponential-backoff executor.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Positional state vector decoding.
pub mod decode;
/// OpenSky `/states/all` client.
pub mod opensky;
/// Deterministic exponential backoff.
pub mod retry;
/// OAuth2 client-credentials token manager.
pub mod token;

// --- Public API Re-exports ---
pub use opensky::{BoundingBox, FetchStates, OpenSkyClient, OpenSkySettings, UnauthorizedPolicy};
pub use retry::{retry, RetryPolicy};
pub use token::TokenManager;
