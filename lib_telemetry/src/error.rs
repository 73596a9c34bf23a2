//! # Error Taxonomy
//!
//! Every failure in the pipeline is classified by the granularity at which it
//! is contained:
//!
//! - **Per record / per event**: [`FetchError::Decode`] and [`PublishError`] are
//!   logged and skipped. They never abort a sibling record.
//! - **Per cycle**: [`AuthError`] and the remaining [`FetchError`] variants are
//!   retried by the retry executor.
//! - **Per batch**: [`StoreError`] rolls back the batch transaction and is
//!   reported to the batch subscriber.
//! - **Terminal**: [`PollerError::Escalated`] is returned to the binary, which
//!   shuts the process down.

use thiserror::Error;

/// Token exchange against the auth endpoint failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthError {
    /// The auth endpoint answered with a non-2xx status.
    #[error("token exchange rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code returned by the auth server.
        status: u16,
        /// Response body, kept for diagnostics.
        body: String,
    },
    /// The response body was not JSON or carried no `access_token`.
    #[error("malformed token response: {0}")]
    MalformedResponse(String),
    /// The request never produced a response.
    #[error("auth endpoint unreachable: {0}")]
    Transport(String),
}

/// A single fetch of the bounded-region state vectors failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    /// The token could not be obtained before issuing the query.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    /// Upstream answered 401 and the configured policy gave up.
    #[error("unauthorized: token expired or invalid")]
    Unauthorized,
    /// Upstream answered 429.
    #[error("rate limited by upstream")]
    RateLimited,
    /// The envelope (`{time, states}`) could not be decoded.
    #[error("undecodable upstream payload: {0}")]
    Decode(String),
    /// Network failure or an unexpected HTTP status.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Publishing one event onto the topic failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PublishError {
    /// The event could not be serialized to the wire format.
    #[error("failed to encode event {key}: {reason}")]
    Encode {
        /// Routing key (ICAO24) of the event.
        key: String,
        /// Serializer message.
        reason: String,
    },
    /// The topic backend refused the message.
    #[error("topic rejected event {key}: {reason}")]
    Rejected {
        /// Routing key (ICAO24) of the event.
        key: String,
        /// Backend message.
        reason: String,
    },
}

/// The consuming side of a topic failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// Subscribing to the topic failed.
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe {
        /// Topic name.
        topic: String,
        /// Backend message.
        reason: String,
    },
    /// The poll itself failed (not a timeout).
    #[error("poll failed: {0}")]
    Poll(String),
    /// Every producer is gone and nothing more will arrive.
    #[error("topic closed")]
    Closed,
}

/// Persisting a batch failed; nothing from the batch was committed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// No store handle is configured or the pool cannot hand out a connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Writing one chunk failed and the transaction was rolled back.
    #[error("chunk starting at row {offset} failed: {reason}")]
    ChunkFailed {
        /// Index of the first row of the failing chunk within the batch.
        offset: usize,
        /// Backend message.
        reason: String,
    },
    /// Begin or commit failed.
    #[error("transaction failed: {0}")]
    Transaction(String),
}

/// Terminal outcome of the producer loop.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PollerError {
    /// Too many consecutive cycles exhausted their retries.
    #[error("upstream unavailable for {failures} consecutive cycles (last error: {last_error})")]
    Escalated {
        /// Number of consecutive failed cycles that triggered escalation.
        failures: u32,
        /// The error of the final failed cycle.
        last_error: FetchError,
    },
}

/// Loading a credentials file failed.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// The file could not be read.
    #[error("cannot read credentials file {path}: {source}")]
    Io {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file was not the expected `{clientId, clientSecret}` JSON object.
    #[error("invalid credentials file {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    /// True for failures caused by the token rather than the network.
    pub fn is_auth_related(&self) -> bool {
        matches!(self, FetchError::Auth(_) | FetchError::Unauthorized)
    }
}
