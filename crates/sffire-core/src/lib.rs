//! Core incident model, watermark, and record validation for the SF fire sync.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "sffire-core";

/// Timestamp layout the source API expects inside `$where` literals.
pub const SOURCE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One incident exactly as the source API returned it.
pub type RawIncident = Map<String, JsonValue>;

/// Destination columns in write order. `_loaded_at` is owned by the database.
pub const INCIDENT_COLUMNS: [&str; 15] = [
    "incident_number",
    "id",
    "incident_date",
    "alarm_dttm",
    "arrival_dttm",
    "close_dttm",
    "address",
    "city",
    "zipcode",
    "battalion",
    "station_area",
    "supervisor_district",
    "neighborhood_district",
    "point",
    "data_loaded_at",
];

const TIMESTAMP_LAYOUTS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Validated, write-ready form of one incident.
///
/// Optional fields that were absent in the raw record are `None`, never
/// skipped, so every row binds the full column set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub incident_number: String,
    pub id: String,
    pub incident_date: NaiveDateTime,
    pub alarm_dttm: Option<NaiveDateTime>,
    pub arrival_dttm: Option<NaiveDateTime>,
    pub close_dttm: Option<NaiveDateTime>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zipcode: Option<String>,
    pub battalion: Option<String>,
    pub station_area: Option<String>,
    pub supervisor_district: Option<String>,
    pub neighborhood_district: Option<String>,
    /// Well-known-text `POINT(lon lat)`.
    pub point: Option<String>,
    pub data_loaded_at: NaiveDateTime,
}

/// Inclusive lower bound on `incident_date` for one extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark(NaiveDateTime);

impl Watermark {
    pub fn new(since: NaiveDateTime) -> Self {
        Self(since)
    }

    /// `now` minus `window`, clamped to the earliest representable time.
    pub fn lookback(now: NaiveDateTime, window: Duration) -> Self {
        Self(now.checked_sub_signed(window).unwrap_or(NaiveDateTime::MIN))
    }

    pub fn since(&self) -> NaiveDateTime {
        self.0
    }

    /// The watermark rendered for a SoQL timestamp literal.
    pub fn to_api_literal(&self) -> String {
        self.0.format(SOURCE_TIMESTAMP_FORMAT).to_string()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_api_literal())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required field `{field}` is missing")]
    Missing { field: &'static str },
    #[error("required field `{field}` is empty")]
    Empty { field: &'static str },
    #[error("field `{field}` holds an unparsable timestamp {value:?}")]
    Timestamp { field: &'static str, value: String },
    #[error("field `{field}` expected {expected}, found {found}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

impl ValidationError {
    /// Name of the offending field.
    pub fn field(&self) -> &'static str {
        match self {
            Self::Missing { field }
            | Self::Empty { field }
            | Self::Timestamp { field, .. }
            | Self::WrongType { field, .. } => field,
        }
    }
}

/// Normalize one raw record into a [`CanonicalRow`].
///
/// `id`, `incident_number`, `incident_date` and `data_loaded_at` are
/// required. Optional timestamps that fail to parse become `None`, and a
/// malformed `point` renders as `None` instead of failing the record.
pub fn validate_record(raw: &RawIncident) -> Result<CanonicalRow, ValidationError> {
    Ok(CanonicalRow {
        incident_number: required_text(raw, "incident_number")?,
        id: required_text(raw, "id")?,
        incident_date: required_timestamp(raw, "incident_date")?,
        alarm_dttm: optional_timestamp(raw, "alarm_dttm"),
        arrival_dttm: optional_timestamp(raw, "arrival_dttm"),
        close_dttm: optional_timestamp(raw, "close_dttm"),
        address: optional_text(raw, "address")?,
        city: optional_text(raw, "city")?,
        zipcode: optional_text(raw, "zipcode")?,
        battalion: optional_text(raw, "battalion")?,
        station_area: optional_text(raw, "station_area")?,
        supervisor_district: optional_text(raw, "supervisor_district")?,
        neighborhood_district: optional_text(raw, "neighborhood_district")?,
        point: render_point(raw.get("point")),
        data_loaded_at: required_timestamp(raw, "data_loaded_at")?,
    })
}

/// Parse the timestamp shapes the source emits (floating ISO-8601 with or
/// without fractional seconds, RFC 3339 with an offset, or a bare date).
pub fn parse_source_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for layout in TIMESTAMP_LAYOUTS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(ts);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

/// Render a GeoJSON-style point as `POINT(lon lat)`.
pub fn render_point(value: Option<&JsonValue>) -> Option<String> {
    let coordinates = value?.as_object()?.get("coordinates")?.as_array()?;
    let [lon, lat] = coordinates.as_slice() else {
        return None;
    };
    let lon = lon.as_f64().filter(|v| v.is_finite())?;
    let lat = lat.as_f64().filter(|v| v.is_finite())?;
    Some(format!("POINT({lon} {lat})"))
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn present<'a>(raw: &'a RawIncident, field: &str) -> Option<&'a JsonValue> {
    raw.get(field).filter(|value| !value.is_null())
}

fn required_text(raw: &RawIncident, field: &'static str) -> Result<String, ValidationError> {
    match present(raw, field) {
        None => Err(ValidationError::Missing { field }),
        Some(JsonValue::String(text)) if text.trim().is_empty() => {
            Err(ValidationError::Empty { field })
        }
        Some(JsonValue::String(text)) => Ok(text.clone()),
        Some(other) => Err(ValidationError::WrongType {
            field,
            expected: "string",
            found: json_kind(other),
        }),
    }
}

fn optional_text(
    raw: &RawIncident,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match present(raw, field) {
        None => Ok(None),
        Some(JsonValue::String(text)) => Ok(Some(text.clone())),
        Some(JsonValue::Number(number)) => Ok(Some(number.to_string())),
        Some(other) => Err(ValidationError::WrongType {
            field,
            expected: "string",
            found: json_kind(other),
        }),
    }
}

fn required_timestamp(
    raw: &RawIncident,
    field: &'static str,
) -> Result<NaiveDateTime, ValidationError> {
    match present(raw, field) {
        None => Err(ValidationError::Missing { field }),
        Some(JsonValue::String(text)) => {
            parse_source_timestamp(text).ok_or_else(|| ValidationError::Timestamp {
                field,
                value: text.clone(),
            })
        }
        Some(other) => Err(ValidationError::WrongType {
            field,
            expected: "timestamp string",
            found: json_kind(other),
        }),
    }
}

fn optional_timestamp(raw: &RawIncident, field: &str) -> Option<NaiveDateTime> {
    present(raw, field)?.as_str().and_then(parse_source_timestamp)
}
