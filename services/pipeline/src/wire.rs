//! Decoding of raw-event payloads as they arrive on the transport.
//!
//! Accepted shapes:
//! - a single [`RawEvent`] object
//! - a JSON array of raw events
//! - `{"events": [...]}`
//! - `{"type": "event", "payload": {...}}` carrying an [`EventRecord`]
//! - `{"type": "ping"}` / `{"type": "hello"}`, which decode to no events

use crate::event::{RawEvent, Timestamp};
use crate::geo::GeoPoint;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported message type: {0}")]
    UnsupportedType(String),

    #[error("Payload is not an event, an event list or an envelope")]
    UnrecognizedShape,
}

/// Flat event record with separate coordinates, as published by the
/// operational backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    #[serde(default)]
    pub ts: Option<Timestamp>,
    #[serde(default)]
    pub shpt_no: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub remark: Option<String>,
}

impl From<EventRecord> for RawEvent {
    fn from(r: EventRecord) -> Self {
        let mut meta = Map::new();
        for (key, value) in [("status", r.status), ("location_id", r.location_id), ("remark", r.remark)] {
            if let Some(v) = value {
                meta.insert(key.to_string(), Value::String(v));
            }
        }
        RawEvent {
            id: Some(r.event_id),
            ts: r.ts,
            position: Some(GeoPoint::new(r.lon, r.lat)),
            shpt_no: r.shpt_no,
            tracker_id: None,
            meta,
        }
    }
}

pub fn decode_payload(bytes: &[u8]) -> Result<Vec<RawEvent>, WireError> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode_value(value)
}

/// Decode each element on its own. An element that is not a raw event is
/// skipped so the rest of the batch still gets through.
fn decode_items(items: Vec<Value>) -> Vec<RawEvent> {
    items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| match serde_json::from_value(item) {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(item_index = i, error = %e, "Skipping undecodable event in batch");
                None
            }
        })
        .collect()
}

pub fn decode_value(value: Value) -> Result<Vec<RawEvent>, WireError> {
    match value {
        Value::Array(items) => Ok(decode_items(items)),
        Value::Object(mut obj) => {
            if let Some(ty) = obj.get("type").and_then(Value::as_str) {
                return match ty {
                    "ping" | "hello" => Ok(Vec::new()),
                    "event" => {
                        let payload = obj.remove("payload").ok_or(WireError::UnrecognizedShape)?;
                        let record: EventRecord = serde_json::from_value(payload)?;
                        Ok(vec![record.into()])
                    }
                    other => Err(WireError::UnsupportedType(other.to_string())),
                };
            }
            if let Some(events) = obj.remove("events") {
                return match events {
                    Value::Array(_) => decode_value(events),
                    _ => Err(WireError::UnrecognizedShape),
                };
            }
            Ok(vec![serde_json::from_value(Value::Object(obj))?])
        }
        _ => Err(WireError::UnrecognizedShape),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_and_array() {
        let one = decode_payload(br#"{"id":"e1","ts":1,"position":[54.0,24.0]}"#).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].id.as_deref(), Some("e1"));

        let many = decode_payload(br#"[{"id":"a","position":[1,2]},{"id":"b"}]"#).unwrap();
        assert_eq!(many.len(), 2);
        assert!(many[1].position.is_none());
    }

    #[test]
    fn test_bad_item_does_not_sink_its_batch() {
        let batch = decode_payload(
            br#"[{"id":"good","position":[54.4,24.3]},{"id":7,"position":[1,2]},{"id":"bad","position":"nope"},{"id":"alt","position":[54.5,24.3,5.0]}]"#,
        )
        .unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("good"), Some("bad"), Some("alt")]);
        assert!(batch[1].position.is_none());
        assert_eq!(batch[2].position, Some(GeoPoint::new(54.5, 24.3)));

        let enveloped = decode_payload(br#"{"events":[{"id":7},{"id":"ok","position":[1,2]}]}"#).unwrap();
        assert_eq!(enveloped.len(), 1);
        assert_eq!(enveloped[0].id.as_deref(), Some("ok"));
    }

    #[test]
    fn test_events_envelope() {
        let batch = decode_payload(br#"{"events":[{"id":"a","position":[1,2]}]}"#).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(
            decode_payload(br#"{"events":"nope"}"#),
            Err(WireError::UnrecognizedShape)
        ));
    }

    #[test]
    fn test_backend_event_envelope() {
        let body = br#"{"type":"event","payload":{"event_id":"EV-1","ts":"2024-01-15T10:30:00Z","shpt_no":"S1","status":"DELAYED","location_id":"MOSB","lat":24.3,"lon":54.4,"remark":"tide"}}"#;
        let batch = decode_payload(body).unwrap();
        assert_eq!(batch.len(), 1);
        let e = &batch[0];
        assert_eq!(e.id.as_deref(), Some("EV-1"));
        assert_eq!(e.position, Some(GeoPoint::new(54.4, 24.3)));
        assert_eq!(e.meta["status"], "DELAYED");
        assert_eq!(e.meta["location_id"], "MOSB");
        assert_eq!(e.meta["remark"], "tide");
    }

    #[test]
    fn test_control_and_garbage() {
        assert!(decode_payload(br#"{"type":"ping"}"#).unwrap().is_empty());
        assert!(decode_payload(br#"{"type":"hello"}"#).unwrap().is_empty());
        assert!(matches!(
            decode_payload(br#"{"type":"location_status"}"#),
            Err(WireError::UnsupportedType(_))
        ));
        assert!(matches!(decode_payload(b"42"), Err(WireError::UnrecognizedShape)));
        assert!(matches!(decode_payload(b"{not json"), Err(WireError::Json(_))));
    }
}
