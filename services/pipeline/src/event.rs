//! Raw and annotated shipment events.

use crate::geo::GeoPoint;
use crate::geofence::ZoneKind;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Well-known values of the `status` metadata field
pub mod status {
    pub const PLANNED: &str = "PLANNED";
    pub const IN_TRANSIT: &str = "IN_TRANSIT";
    pub const ARRIVED: &str = "ARRIVED";
    pub const DELAYED: &str = "DELAYED";
    pub const HOLD: &str = "HOLD";
}

/// Weight stamped on every freshly annotated event
pub const DEFAULT_EVENT_WEIGHT: u8 = 1;

/// Producer timestamp: epoch milliseconds or a timestamp string
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    EpochMillis(i64),
    Fractional(f64),
    Text(String),
}

impl Timestamp {
    /// Epoch milliseconds, or `None` when the value cannot be interpreted.
    pub fn epoch_millis(&self) -> Option<i64> {
        match self {
            Timestamp::EpochMillis(ms) => Some(*ms),
            Timestamp::Fractional(ms) if ms.is_finite() => Some(ms.trunc() as i64),
            Timestamp::Fractional(_) => None,
            Timestamp::Text(text) => parse_timestamp_str(text),
        }
    }
}

impl From<i64> for Timestamp {
    fn from(ms: i64) -> Self {
        Timestamp::EpochMillis(ms)
    }
}

impl From<&str> for Timestamp {
    fn from(s: &str) -> Self {
        Timestamp::Text(s.to_string())
    }
}

/// Normalize a producer timestamp, falling back to `now_ms` when it is
/// missing or unparseable.
pub fn normalize_timestamp(ts: Option<&Timestamp>, now_ms: i64) -> i64 {
    ts.and_then(Timestamp::epoch_millis).unwrap_or(now_ms)
}

/// RFC 3339 first, then zone-less ISO-8601 (read as UTC), then a bare
/// integer of epoch milliseconds.
fn parse_timestamp_str(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    text.parse::<i64>().ok()
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// RFC 3339 rendering of epoch milliseconds (UTC)
pub fn millis_to_rfc3339(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// A position-tagged event as delivered by the transport.
///
/// Every field is optional on the wire so malformed payloads still decode;
/// ingestion drops events without an id or a position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub ts: Option<Timestamp>,
    #[serde(default, deserialize_with = "lenient_position")]
    pub position: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shpt_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

/// `[lng, lat, ..]` with extra ordinates ignored. Any other shape decodes
/// as no position, so the event is dropped at ingest instead of failing
/// the whole payload.
fn lenient_position<'de, D>(deserializer: D) -> Result<Option<GeoPoint>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_array)
        .and_then(|coords| match coords.as_slice() {
            [lon, lat, ..] => Some(GeoPoint::new(lon.as_f64()?, lat.as_f64()?)),
            _ => None,
        }))
}

impl RawEvent {
    pub fn new(id: impl Into<String>, position: GeoPoint) -> Self {
        Self {
            id: Some(id.into()),
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn with_ts(mut self, ts: impl Into<Timestamp>) -> Self {
        self.ts = Some(ts.into());
        self
    }

    pub fn with_shipment(mut self, shpt_no: impl Into<String>) -> Self {
        self.shpt_no = Some(shpt_no.into());
        self
    }

    pub fn with_tracker(mut self, tracker_id: impl Into<String>) -> Self {
        self.tracker_id = Some(tracker_id.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_status(self, status: &str) -> Self {
        self.with_meta("status", status)
    }
}

/// Zone transition classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Enter,
    Exit,
    Move,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Enter => "enter",
            EventType::Exit => "exit",
            EventType::Move => "move",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enter" => Ok(EventType::Enter),
            "exit" => Ok(EventType::Exit),
            "move" => Ok(EventType::Move),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw event enriched with its resolved zone and transition type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedEvent {
    pub id: String,
    /// Timestamp exactly as the producer sent it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Timestamp>,
    pub ts_ms: i64,
    pub position: GeoPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shpt_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_id: Option<String>,
    #[serde(default)]
    pub meta: Map<String, Value>,
    pub zone_id: Option<String>,
    pub zone_kind: Option<ZoneKind>,
    pub event_type: EventType,
    pub weight: u8,
}

impl AnnotatedEvent {
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<&str> {
        self.meta_str("status")
    }

    pub fn location_id(&self) -> Option<&str> {
        self.meta_str("location_id")
    }

    /// Explicit speed reported by the producer, if positive and finite.
    pub fn speed_kph(&self) -> Option<f64> {
        self.meta
            .get("speed_kph")
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite() && *v > 0.0)
    }
}
