//! # Live Stream Server
//!
//! Serves the broadcast hub over Server-Sent Events.
//!
//! `GET /sse/flights` joins the hub, sends a `connection_ack` frame and then
//! one `data:` frame per telemetry event. Batches are unrolled here; a client
//! never sees an array. The subscription is dropped with the response body,
//! which unregisters it from the hub.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderValue, Method, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use lib_telemetry::core::{HubHandle, Subscription};
use lib_telemetry::TelemetryEvent;

/// # Stream Server Settings
#[derive(Debug, Clone, PartialEq)]
pub struct StreamServerSettings {
    /// TCP port the SSE endpoint listens on.
    pub port: u16,
    /// Exact origins allowed by CORS.
    pub allowed_origins: Vec<String>,
}

impl Default for StreamServerSettings {
    fn default() -> Self {
        Self {
            port: 8081,
            allowed_origins: vec!["http://localhost:3000".to_string()],
        }
    }
}

#[derive(Clone)]
struct StreamState {
    hub: HubHandle,
}

/// `/health` and `/sse/flights` behind the CORS layer.
pub fn router(hub: HubHandle, settings: &StreamServerSettings) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sse/flights", get(flights_handler))
        .layer(cors_layer(&settings.allowed_origins))
        .with_state(StreamState { hub })
}

/// Binds `0.0.0.0:<port>` and serves until `cancel` fires.
pub async fn serve(hub: HubHandle, settings: StreamServerSettings, cancel: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind live stream server to {}", addr))?;
    serve_on(listener, hub, &settings, cancel).await
}

/// Serves on an already bound listener.
pub async fn serve_on(
    listener: TcpListener,
    hub: HubHandle,
    settings: &StreamServerSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    log::info!("Live stream available at http://{}/sse/flights", local);

    axum::serve(listener, router(hub, settings))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("live stream server failed")?;

    log::info!("Live stream server stopped.");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        // A wildcard is not allowed together with credentials.
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn health_handler(State(state): State<StreamState>) -> impl IntoResponse {
    let subscribers = state.hub.stats().await.map(|s| s.subscribers);
    let status = if subscribers.is_some() { "ok" } else { "hub stopped" };
    Json(json!({ "status": status, "subscribers": subscribers }))
}

async fn flights_handler(State(state): State<StreamState>) -> impl IntoResponse {
    let subscription = state.hub.join();
    log::debug!("Live subscriber {} connected", subscription.id());

    (
        [(header::CACHE_CONTROL, "no-cache")],
        Sse::new(flight_events(subscription)).keep_alive(KeepAlive::default()),
    )
}

fn connection_ack() -> Event {
    let ack = json!({
        "status": "connected",
        "type": "connection_ack",
        "timestamp": chrono::Utc::now().timestamp(),
        "message": "Flight tracking stream active",
    });
    Event::default().data(ack.to_string())
}

fn event_frame(event: &TelemetryEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(body) => Some(Event::default().data(body)),
        Err(e) => {
            log::warn!("Skipping frame for {}: {}", event.icao24, e);
            None
        }
    }
}

/// Ack first, then every event of every batch in order. Ends when the hub
/// closes the subscription.
fn flight_events(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    let batches = stream::unfold(subscription, |mut subscription| async move {
        let batch = subscription.recv().await?;
        Some((batch, subscription))
    });

    stream::once(async { connection_ack() })
        .chain(batches.flat_map(|batch| {
            let frames: Vec<Event> = batch.iter().filter_map(event_frame).collect();
            stream::iter(frames)
        }))
        .map(Ok)
}
