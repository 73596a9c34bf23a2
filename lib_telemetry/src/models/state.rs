use serde::{Deserialize, Serialize};

/// # State Record
///
/// One aircraft observation exactly as the upstream reported it. Nullable
/// upstream fields stay `Option` here; the nil-to-zero rule is applied only
/// when projecting into a [`TelemetryEvent`](crate::models::TelemetryEvent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Unique ICAO 24-bit transponder address, hex encoded. Never empty.
    pub icao24: String,
    /// Callsign, space padded by the upstream.
    pub callsign: Option<String>,
    /// Country inferred from the ICAO24 address.
    pub origin_country: String,
    /// Unix seconds of the last position update.
    pub time_position: Option<i64>,
    /// Unix seconds of the last message of any kind.
    pub last_contact: i64,
    /// WGS-84 longitude in decimal degrees.
    pub longitude: Option<f64>,
    /// WGS-84 latitude in decimal degrees.
    pub latitude: Option<f64>,
    /// Barometric altitude in meters.
    pub baro_altitude: Option<f64>,
    /// Surface position report.
    pub on_ground: bool,
    /// Ground speed in m/s.
    pub velocity: Option<f64>,
    /// Track angle in decimal degrees clockwise from north.
    pub true_track: Option<f64>,
    /// Vertical rate in m/s.
    pub vertical_rate: Option<f64>,
    /// Receivers that contributed to this state vector.
    pub sensors: Option<Vec<i64>>,
    /// Geometric altitude in meters.
    pub geo_altitude: Option<f64>,
    /// Transponder code.
    pub squawk: Option<String>,
    /// Special purpose indicator.
    pub spi: bool,
    /// 0 = ADS-B, 1 = ASTERIX, 2 = MLAT, 3 = FLARM.
    pub position_source: i64,
    /// Aircraft category, only sent when extended data was requested.
    pub category: Option<i64>,
}
