use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StateRecord;

/// An ordered group of events drained from the topic in one flush window.
pub type Batch = Vec<TelemetryEvent>;

/// # Telemetry Event
///
/// The normalized, null-free projection of a [`StateRecord`]. This is the JSON
/// payload carried on the topic (keyed by `icao24`) and pushed to SSE clients.
///
/// Every nullable upstream number is resolved to `0` / `0.0`; a missing
/// callsign becomes the empty string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// ICAO 24-bit transponder address. Also the topic message key.
    pub icao24: String,
    /// Trimmed callsign, empty when unknown.
    #[serde(default)]
    pub callsign: String,
    /// Country of registration.
    pub origin_country: String,
    /// Latitude in decimal degrees.
    pub lat: f64,
    /// Longitude in decimal degrees.
    pub lon: f64,
    /// Ground speed in m/s.
    pub velocity: f64,
    /// Unix seconds of the last position update.
    pub time_position: i64,
    /// Barometric altitude in meters.
    pub baro_altitude: f64,
    /// Geometric altitude in meters.
    pub geo_altitude: f64,
    /// Unix seconds of the last message of any kind.
    pub last_contact: i64,
}

impl From<&StateRecord> for TelemetryEvent {
    fn from(record: &StateRecord) -> Self {
        Self {
            icao24: record.icao24.clone(),
            callsign: record
                .callsign
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            origin_country: record.origin_country.clone(),
            lat: record.latitude.unwrap_or_default(),
            lon: record.longitude.unwrap_or_default(),
            velocity: record.velocity.unwrap_or_default(),
            time_position: record.time_position.unwrap_or_default(),
            baro_altitude: record.baro_altitude.unwrap_or_default(),
            geo_altitude: record.geo_altitude.unwrap_or_default(),
            last_contact: record.last_contact,
        }
    }
}

impl TelemetryEvent {
    /// Topic routing key.
    pub fn key(&self) -> &str {
        &self.icao24
    }

    /// Encodes the event into its topic payload.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a topic payload back into an event.
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// # Storage Row
///
/// A [`TelemetryEvent`] in the shape the `flight_state_vectors` table expects:
/// Unix seconds become UTC timestamps and the surrogate id is assigned by the
/// database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRow {
    /// `BIGSERIAL` primary key. `None` until the row is inserted.
    pub id: Option<i64>,
    /// ICAO 24-bit transponder address.
    pub icao24: String,
    /// Trimmed callsign.
    pub callsign: String,
    /// Country of registration.
    pub origin_country: String,
    /// Last position update.
    pub time_position: DateTime<Utc>,
    /// Last message of any kind.
    pub last_contact: DateTime<Utc>,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Barometric altitude in meters.
    pub baro_altitude: f64,
    /// Geometric altitude in meters.
    pub geo_altitude: f64,
    /// Ground speed in m/s.
    pub velocity: f64,
}

fn unix_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

impl From<&TelemetryEvent> for StorageRow {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            id: None,
            icao24: event.icao24.clone(),
            callsign: event.callsign.clone(),
            origin_country: event.origin_country.clone(),
            time_position: unix_to_utc(event.time_position),
            last_contact: unix_to_utc(event.last_contact),
            latitude: event.lat,
            longitude: event.lon,
            baro_altitude: event.baro_altitude,
            geo_altitude: event.geo_altitude,
            velocity: event.velocity,
        }
    }
}
