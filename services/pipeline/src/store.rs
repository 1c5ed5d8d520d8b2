//! Bounded, ordered, de-duplicating event ledger.
//!
//! One insertion-ordered [`VecDeque`] backs both eviction policies: the
//! capacity cap pops from the front during ingest, and the time-window prune
//! filters by normalized timestamp. An id set mirrors the deque so dedupe is
//! O(1); it is kept in lockstep on every push, pop and prune.

use crate::annotator::{annotate, EntityZoneState};
use crate::event::{AnnotatedEvent, RawEvent};
use crate::geofence::GeofenceIndex;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, trace};

/// Errors that can occur when constructing a store
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    #[error("Event store capacity must be positive, got {0}")]
    InvalidCapacity(i64),
}

/// What a single ingest call did
#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    /// Newly admitted events, in ingestion order
    pub admitted: Vec<AnnotatedEvent>,
    /// Events skipped because their id was already stored
    pub duplicates: usize,
    /// Events skipped for lacking an id or a position
    pub dropped: usize,
    /// Stored events evicted by the capacity cap
    pub evicted: usize,
}

impl IngestOutcome {
    pub fn changed(&self) -> bool {
        !self.admitted.is_empty()
    }
}

/// Bounded event history plus the per-entity zone state it owns
#[derive(Debug, Clone)]
pub struct EventStore {
    capacity: usize,
    events: VecDeque<AnnotatedEvent>,
    ids: HashSet<String>,
    zone_state: EntityZoneState,
}

impl EventStore {
    /// Create an empty store holding at most `capacity` events.
    pub fn new(capacity: i64) -> Result<Self, StoreError> {
        if capacity <= 0 {
            return Err(StoreError::InvalidCapacity(capacity));
        }
        let capacity = capacity as usize;
        Ok(Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(4096)),
            ids: HashSet::new(),
            zone_state: EntityZoneState::default(),
        })
    }

    /// Annotate and append `raws` in order.
    ///
    /// Per event: skip duplicates and malformed events, resolve the zone,
    /// classify against the entity's last zone, record the new zone, append,
    /// then evict the oldest entry if the cap is exceeded.
    pub fn ingest(
        &mut self,
        raws: impl IntoIterator<Item = RawEvent>,
        index: &GeofenceIndex,
        now_ms: i64,
    ) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();

        for raw in raws {
            if let Some(id) = raw.id.as_deref() {
                if self.ids.contains(id) {
                    trace!(event_id = id, "Skipping duplicate event");
                    outcome.duplicates += 1;
                    continue;
                }
            }

            let annotation = match annotate(raw, index, &self.zone_state, now_ms) {
                Ok(a) => a,
                Err(reason) => {
                    debug!(?reason, "Dropping malformed event");
                    outcome.dropped += 1;
                    continue;
                }
            };

            let event = annotation.event;
            self.zone_state.record(annotation.entity_key, event.zone_id.clone());
            self.ids.insert(event.id.clone());
            self.events.push_back(event.clone());
            outcome.admitted.push(event);

            if self.events.len() > self.capacity {
                if let Some(oldest) = self.events.pop_front() {
                    self.ids.remove(&oldest.id);
                    outcome.evicted += 1;
                }
            }
        }

        outcome
    }

    /// Remove every event whose normalized timestamp is strictly older than
    /// `cutoff_ms`. Returns the number removed. Zone state is untouched.
    pub fn prune_older_than(&mut self, cutoff_ms: i64) -> usize {
        let before = self.events.len();
        let ids = &mut self.ids;
        self.events.retain(|e| {
            let keep = e.ts_ms >= cutoff_ms;
            if !keep {
                ids.remove(&e.id);
            }
            keep
        });
        before - self.events.len()
    }

    /// Stored events, oldest insertion first
    pub fn events(&self) -> &VecDeque<AnnotatedEvent> {
        &self.events
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn zone_state(&self) -> &EntityZoneState {
        &self.zone_state
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Stored events tagged with `location_id` at or after `since_ms`
    pub fn count_by_location(&self, location_id: &str, since_ms: i64) -> usize {
        self.events
            .iter()
            .filter(|e| e.ts_ms >= since_ms && e.location_id() == Some(location_id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::geo::GeoPoint;
    use crate::geofence::{Zone, ZoneGeometry, ZoneKind};

    fn square(id: &str, min_lon: f64) -> Zone {
        let ring = vec![
            GeoPoint::new(min_lon, 0.0),
            GeoPoint::new(min_lon + 1.0, 0.0),
            GeoPoint::new(min_lon + 1.0, 1.0),
            GeoPoint::new(min_lon, 1.0),
            GeoPoint::new(min_lon, 0.0),
        ];
        Zone::new(id, ZoneKind::Site, ZoneGeometry::Polygon(vec![ring]))
    }

    fn two_zones() -> GeofenceIndex {
        GeofenceIndex::build(vec![square("Z1", 0.0), square("Z2", 2.0)])
    }

    fn ev(id: &str, lon: f64, lat: f64, ts: i64) -> RawEvent {
        RawEvent::new(id, GeoPoint::new(lon, lat)).with_shipment("S1").with_ts(ts)
    }

    #[test]
    fn test_rejects_non_positive_capacity() {
        assert_eq!(EventStore::new(0).unwrap_err(), StoreError::InvalidCapacity(0));
        assert_eq!(EventStore::new(-5).unwrap_err(), StoreError::InvalidCapacity(-5));
        assert_eq!(EventStore::new(1).unwrap().capacity(), 1);
    }

    #[test]
    fn test_state_machine_scenario() {
        let index = two_zones();
        let mut store = EventStore::new(100).unwrap();

        let steps = [
            (ev("e1", 10.0, 10.0, 1), EventType::Move, None),
            (ev("e2", 0.5, 0.5, 2), EventType::Enter, Some("Z1")),
            (ev("e3", 0.6, 0.6, 3), EventType::Move, Some("Z1")),
            (ev("e4", 2.5, 0.5, 4), EventType::Enter, Some("Z2")),
            (ev("e5", 10.0, 10.0, 5), EventType::Exit, None),
        ];

        for (raw, expected_type, expected_zone) in steps {
            let out = store.ingest(vec![raw], &index, 0);
            let e = &out.admitted[0];
            assert_eq!(e.event_type, expected_type, "event {}", e.id);
            assert_eq!(e.zone_id.as_deref(), expected_zone, "event {}", e.id);
            if expected_zone.is_none() {
                assert!(e.zone_kind.is_none());
            }
        }
        assert_eq!(store.len(), 5);
        assert_eq!(store.zone_state().last_zone("S1"), None);
        assert!(store.zone_state().contains("S1"));
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let index = two_zones();
        let mut once = EventStore::new(10).unwrap();
        let mut twice = EventStore::new(10).unwrap();

        once.ingest(vec![ev("e1", 0.5, 0.5, 1)], &index, 0);
        twice.ingest(vec![ev("e1", 0.5, 0.5, 1)], &index, 0);
        let second = twice.ingest(vec![ev("e1", 0.5, 0.5, 1)], &index, 0);

        assert_eq!(second.duplicates, 1);
        assert!(!second.changed());
        assert_eq!(once.events(), twice.events());
        assert_eq!(
            once.zone_state().last_zone("S1"),
            twice.zone_state().last_zone("S1")
        );

        // A later in-zone event is still a move, not a second enter
        let next = twice.ingest(vec![ev("e2", 0.7, 0.7, 2)], &index, 0);
        assert_eq!(next.admitted[0].event_type, EventType::Move);
    }

    #[test]
    fn test_duplicate_within_one_batch() {
        let mut store = EventStore::new(10).unwrap();
        let out = store.ingest(
            vec![ev("e1", 0.5, 0.5, 1), ev("e1", 5.0, 5.0, 2)],
            &two_zones(),
            0,
        );
        assert_eq!(out.admitted.len(), 1);
        assert_eq!(out.duplicates, 1);
        assert_eq!(store.events()[0].zone_id.as_deref(), Some("Z1"));
    }

    #[test]
    fn test_malformed_events_are_dropped() {
        let mut store = EventStore::new(10).unwrap();
        let no_id = RawEvent {
            position: Some(GeoPoint::new(0.5, 0.5)),
            shpt_no: Some("S1".into()),
            ..Default::default()
        };
        let no_pos = RawEvent {
            id: Some("e2".into()),
            shpt_no: Some("S1".into()),
            ..Default::default()
        };
        let out = store.ingest(vec![no_id, no_pos], &two_zones(), 0);
        assert_eq!(out.dropped, 2);
        assert!(store.is_empty());
        // Dropped events never touch zone state
        assert!(store.zone_state().is_empty());
    }

    #[test]
    fn test_capacity_keeps_most_recent_inserts() {
        let index = GeofenceIndex::default();
        let mut store = EventStore::new(3).unwrap();

        for batch in [vec!["a", "b"], vec!["c", "a", "d"], vec!["e"]] {
            let raws: Vec<_> = batch
                .into_iter()
                .map(|id| RawEvent::new(id, GeoPoint::new(1.0, 1.0)).with_ts(0))
                .collect();
            store.ingest(raws, &index, 0);
            assert!(store.len() <= 3);
        }

        let ids: Vec<_> = store.events().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "e"]);
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_eviction_is_by_insertion_not_timestamp() {
        let index = GeofenceIndex::default();
        let mut store = EventStore::new(2).unwrap();
        store.ingest(
            vec![
                RawEvent::new("new-ts", GeoPoint::new(1.0, 1.0)).with_ts(9_000),
                RawEvent::new("old-ts", GeoPoint::new(1.0, 1.0)).with_ts(1_000),
                RawEvent::new("mid-ts", GeoPoint::new(1.0, 1.0)).with_ts(5_000),
            ],
            &index,
            0,
        );
        let ids: Vec<_> = store.events().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["old-ts", "mid-ts"]);
    }

    #[test]
    fn test_evicted_id_can_be_ingested_again() {
        let index = GeofenceIndex::default();
        let mut store = EventStore::new(1).unwrap();
        store.ingest(vec![RawEvent::new("a", GeoPoint::new(1.0, 1.0))], &index, 0);
        let out = store.ingest(vec![RawEvent::new("b", GeoPoint::new(1.0, 1.0))], &index, 0);
        assert_eq!(out.evicted, 1);

        let again = store.ingest(vec![RawEvent::new("a", GeoPoint::new(1.0, 1.0))], &index, 0);
        assert_eq!(again.admitted.len(), 1);
    }

    #[test]
    fn test_prune_window() {
        let index = two_zones();
        let mut store = EventStore::new(10).unwrap();
        store.ingest(
            vec![ev("e1", 9.0, 9.0, 100), ev("e2", 9.0, 9.0, 200), ev("e3", 9.0, 9.0, 300)],
            &index,
            0,
        );

        assert_eq!(store.prune_older_than(50), 0);
        assert_eq!(store.len(), 3);

        assert_eq!(store.prune_older_than(200), 1);
        assert!(!store.contains("e1"));
        assert!(store.contains("e2"));

        assert_eq!(store.prune_older_than(301), 2);
        assert!(store.is_empty());
        // Zone state survives pruning
        assert!(store.zone_state().contains("S1"));
    }

    #[test]
    fn test_unparseable_timestamp_uses_now() {
        let mut store = EventStore::new(10).unwrap();
        let raw = RawEvent::new("e1", GeoPoint::new(1.0, 1.0)).with_ts("not a time");
        store.ingest(vec![raw], &GeofenceIndex::default(), 12_345);
        assert_eq!(store.events()[0].ts_ms, 12_345);
    }

    #[test]
    fn test_keyless_event_is_its_own_entity() {
        let index = two_zones();
        let mut store = EventStore::new(10).unwrap();
        let out = store.ingest(
            vec![
                RawEvent::new("lonely-1", GeoPoint::new(0.5, 0.5)),
                RawEvent::new("lonely-2", GeoPoint::new(5.0, 5.0)),
            ],
            &index,
            0,
        );
        // Keyed by its own id, so it is always a first sighting
        assert_eq!(out.admitted[0].event_type, EventType::Enter);
        assert_eq!(out.admitted[1].event_type, EventType::Move);
    }

    #[test]
    fn test_count_by_location() {
        let mut store = EventStore::new(10).unwrap();
        store.ingest(
            vec![
                ev("e1", 9.0, 9.0, 100).with_meta("location_id", "MOSB"),
                ev("e2", 9.0, 9.0, 200).with_meta("location_id", "MOSB"),
                ev("e3", 9.0, 9.0, 300).with_meta("location_id", "SITE_A"),
            ],
            &GeofenceIndex::default(),
            0,
        );
        assert_eq!(store.count_by_location("MOSB", 0), 2);
        assert_eq!(store.count_by_location("MOSB", 150), 1);
        assert_eq!(store.count_by_location("NOWHERE", 0), 0);
    }
}
