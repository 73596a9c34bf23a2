//! # Positional State Vector Decoder
//!
//! OpenSky returns each state vector as a heterogeneous JSON array whose meaning
//! is defined by position. This module turns those arrays into [`StateRecord`]s.
//!
//! Every field is read through [`Field`], a tagged outcome that separates a
//! present value, an explicit `null`, and a value of the wrong type. A record
//! with any malformed field is rejected as a whole; a `null` in an optional
//! slot is not an error.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::FetchError;
use crate::models::StateRecord;

/// Minimum number of positional fields in a usable state vector.
pub const MIN_FIELDS: usize = 17;

const FIELD_NAMES: [&str; 18] = [
    "icao24",
    "callsign",
    "origin_country",
    "time_position",
    "last_contact",
    "longitude",
    "latitude",
    "baro_altitude",
    "on_ground",
    "velocity",
    "true_track",
    "vertical_rate",
    "sensors",
    "geo_altitude",
    "squawk",
    "spi",
    "position_source",
    "category",
];

/// Outcome of reading one positional field.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    /// The slot held a value of the expected type.
    Present(T),
    /// The slot was `null` or beyond the end of the array.
    Absent,
    /// The slot held a value of the wrong type.
    Malformed,
}

/// Why one state vector was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    /// The element was not a JSON array.
    #[error("state vector is not an array")]
    NotAnArray,
    /// The array had fewer than [`MIN_FIELDS`] elements.
    #[error("state vector has {0} fields, expected at least 17")]
    TooShort(usize),
    /// A field was missing where required, or had the wrong type.
    #[error("field {index} ({name}) is missing or malformed")]
    BadField {
        /// Positional index of the offending field.
        index: usize,
        /// Field name.
        name: &'static str,
    },
}

/// The `/states/all` response envelope.
#[derive(Debug, Deserialize)]
pub struct StatesEnvelope {
    /// Unix seconds the snapshot refers to.
    pub time: i64,
    /// Raw state vectors. OpenSky sends `null` when the region is empty.
    #[serde(default)]
    pub states: Option<Vec<Value>>,
}

fn slot(row: &[Value], index: usize) -> Option<&Value> {
    row.get(index).filter(|v| !v.is_null())
}

fn read_str(row: &[Value], index: usize) -> Field<String> {
    match slot(row, index) {
        None => Field::Absent,
        Some(Value::String(s)) => Field::Present(s.clone()),
        Some(_) => Field::Malformed,
    }
}

fn read_f64(row: &[Value], index: usize) -> Field<f64> {
    match slot(row, index).map(Value::as_f64) {
        None => Field::Absent,
        Some(Some(n)) => Field::Present(n),
        Some(None) => Field::Malformed,
    }
}

// Timestamps arrive as integers but some mirrors send floats.
fn read_i64(row: &[Value], index: usize) -> Field<i64> {
    match slot(row, index) {
        None => Field::Absent,
        Some(v) => match v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)) {
            Some(n) => Field::Present(n),
            None => Field::Malformed,
        },
    }
}

fn read_bool(row: &[Value], index: usize) -> Field<bool> {
    match slot(row, index) {
        None => Field::Absent,
        Some(Value::Bool(b)) => Field::Present(*b),
        Some(_) => Field::Malformed,
    }
}

fn read_ids(row: &[Value], index: usize) -> Field<Vec<i64>> {
    match slot(row, index) {
        None => Field::Absent,
        Some(Value::Array(items)) => items
            .iter()
            .map(Value::as_i64)
            .collect::<Option<Vec<_>>>()
            .map_or(Field::Malformed, Field::Present),
        Some(_) => Field::Malformed,
    }
}

fn bad(index: usize) -> RecordError {
    RecordError::BadField {
        index,
        name: FIELD_NAMES[index],
    }
}

fn required<T>(field: Field<T>, index: usize) -> Result<T, RecordError> {
    match field {
        Field::Present(v) => Ok(v),
        Field::Absent | Field::Malformed => Err(bad(index)),
    }
}

fn optional<T>(field: Field<T>, index: usize) -> Result<Option<T>, RecordError> {
    match field {
        Field::Present(v) => Ok(Some(v)),
        Field::Absent => Ok(None),
        Field::Malformed => Err(bad(index)),
    }
}

/// Decodes one positional state vector.
pub fn decode_record(raw: &Value) -> Result<StateRecord, RecordError> {
    let row = raw.as_array().ok_or(RecordError::NotAnArray)?;
    if row.len() < MIN_FIELDS {
        return Err(RecordError::TooShort(row.len()));
    }

    let icao24 = required(read_str(row, 0), 0)?;
    if icao24.is_empty() {
        return Err(bad(0));
    }

    Ok(StateRecord {
        icao24,
        callsign: optional(read_str(row, 1), 1)?,
        origin_country: optional(read_str(row, 2), 2)?.unwrap_or_default(),
        time_position: optional(read_i64(row, 3), 3)?,
        last_contact: required(read_i64(row, 4), 4)?,
        longitude: optional(read_f64(row, 5), 5)?,
        latitude: optional(read_f64(row, 6), 6)?,
        baro_altitude: optional(read_f64(row, 7), 7)?,
        on_ground: optional(read_bool(row, 8), 8)?.unwrap_or_default(),
        velocity: optional(read_f64(row, 9), 9)?,
        true_track: optional(read_f64(row, 10), 10)?,
        vertical_rate: optional(read_f64(row, 11), 11)?,
        sensors: optional(read_ids(row, 12), 12)?,
        geo_altitude: optional(read_f64(row, 13), 13)?,
        squawk: optional(read_str(row, 14), 14)?,
        spi: optional(read_bool(row, 15), 15)?.unwrap_or_default(),
        position_source: optional(read_i64(row, 16), 16)?.unwrap_or_default(),
        category: optional(read_i64(row, 17), 17)?,
    })
}

/// Decodes a full `/states/all` body.
///
/// Only an undecodable envelope is an error. Bad records are logged and skipped.
pub fn decode_states(body: &[u8]) -> Result<Vec<StateRecord>, FetchError> {
    let envelope: StatesEnvelope =
        serde_json::from_slice(body).map_err(|e| FetchError::Decode(e.to_string()))?;

    let raw = envelope.states.unwrap_or_default();
    let mut records = Vec::with_capacity(raw.len());
    for (position, element) in raw.iter().enumerate() {
        match decode_record(element) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping state vector #{}: {}", position, e),
        }
    }

    log::debug!(
        "Decoded {}/{} state vectors (snapshot time {})",
        records.len(),
        raw.len(),
        envelope.time
    );
    Ok(records)
}
