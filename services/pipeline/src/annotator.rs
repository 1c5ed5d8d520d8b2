//! Zone resolution and enter/exit/move classification.
//!
//! Annotation itself is stateless: it reads the last-known zone of the
//! event's entity from an [`EntityZoneState`] but never writes it. The
//! [`EventStore`](crate::store::EventStore) records the new zone after it
//! admits the event.

use crate::event::{normalize_timestamp, AnnotatedEvent, EventType, RawEvent, DEFAULT_EVENT_WEIGHT};
use crate::geo::GeoPoint;
use crate::geofence::GeofenceIndex;
use std::collections::HashMap;

/// Last-known zone per entity key. `None` means "seen, outside every zone".
#[derive(Debug, Clone, Default)]
pub struct EntityZoneState {
    last_zone: HashMap<String, Option<String>>,
}

impl EntityZoneState {
    /// Last recorded zone for `key`; `None` both for unseen entities and for
    /// entities last seen outside every zone.
    pub fn last_zone(&self, key: &str) -> Option<&str> {
        self.last_zone.get(key).and_then(|z| z.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.last_zone.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.last_zone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_zone.is_empty()
    }

    pub(crate) fn record(&mut self, key: String, zone: Option<String>) {
        self.last_zone.insert(key, zone);
    }
}

/// Why an event could not be annotated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingId,
    MissingPosition,
}

/// An annotated event plus the entity key its zone must be recorded under
#[derive(Debug, Clone)]
pub struct Annotation {
    pub event: AnnotatedEvent,
    pub entity_key: String,
}

/// Tracker id, then shipment number, then the event's own id.
pub fn entity_key(raw: &RawEvent) -> Option<&str> {
    raw.tracker_id
        .as_deref()
        .or(raw.shpt_no.as_deref())
        .or(raw.id.as_deref())
}

/// Transition type from the previous zone to the newly resolved one.
///
/// A direct zone-to-zone change is reported as a single `Enter` of the new
/// zone; no `Exit` is emitted for the old one.
pub fn classify(prev_zone: Option<&str>, new_zone: Option<&str>) -> EventType {
    match (prev_zone, new_zone) {
        (None, None) => EventType::Move,
        (None, Some(_)) => EventType::Enter,
        (Some(_), None) => EventType::Exit,
        (Some(prev), Some(new)) if prev == new => EventType::Move,
        (Some(_), Some(_)) => EventType::Enter,
    }
}

/// Resolve `raw` against `index` and classify it against `zones`.
///
/// Positions that are non-finite or out of range count as missing.
pub fn annotate(
    raw: RawEvent,
    index: &GeofenceIndex,
    zones: &EntityZoneState,
    now_ms: i64,
) -> Result<Annotation, Rejection> {
    let entity_key = entity_key(&raw).ok_or(Rejection::MissingId)?.to_string();
    let RawEvent {
        id,
        ts,
        position,
        shpt_no,
        tracker_id,
        meta,
    } = raw;

    let id = id.ok_or(Rejection::MissingId)?;
    let position: GeoPoint = position
        .filter(GeoPoint::is_valid)
        .ok_or(Rejection::MissingPosition)?;

    let ts_ms = normalize_timestamp(ts.as_ref(), now_ms);
    let zone = index.find_zone(position);
    let new_zone = zone.as_ref().map(|z| z.zone_id.as_str());
    let event_type = classify(zones.last_zone(&entity_key), new_zone);

    Ok(Annotation {
        event: AnnotatedEvent {
            id,
            ts,
            ts_ms,
            position,
            shpt_no,
            tracker_id,
            meta,
            zone_id: zone.as_ref().map(|z| z.zone_id.clone()),
            zone_kind: zone.map(|z| z.zone_kind),
            event_type,
            weight: DEFAULT_EVENT_WEIGHT,
        },
        entity_key,
    })
}
