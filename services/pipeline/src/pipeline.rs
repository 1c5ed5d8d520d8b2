//! The single logical owner of the event store.
//!
//! All mutation goes through one `RwLock` write guard so that dedupe,
//! classification, append and eviction for a batch happen as one unit.
//! Projections take the read guard and never observe a half-applied batch.

use crate::config::{ConfigError, PipelineConfig};
use crate::event::{now_millis, AnnotatedEvent, RawEvent};
use crate::geofence::{GeofenceError, GeofenceIndex};
use crate::location_status::{LocationStatus, LocationStatusBoard, LocationStatusUpdate, StatusError};
use crate::projector::{
    project_eta, project_heatmap, project_shipments, EtaSettings, EtaWedge, HeatPoint, HeatmapFilter,
    ShipmentSnapshot,
};
use crate::reference::{CsvReferenceProvider, Leg, Location, ReferenceData, ReferenceError, ReferenceProvider};
use crate::store::{EventStore, IngestOutcome, StoreError};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

const MS_PER_HOUR: i64 = 3_600_000;

/// Start of a window of `window_hours` ending at `now_ms`. Saturates
/// instead of overflowing for very wide windows.
fn window_cutoff(now_ms: i64, window_hours: i64) -> i64 {
    now_ms.saturating_sub(window_hours.saturating_mul(MS_PER_HOUR))
}

/// Errors that can occur while assembling a pipeline from configuration
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to load zones: {0}")]
    Zones(#[from] GeofenceError),

    #[error("Failed to load reference data: {0}")]
    Reference(#[from] ReferenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fired after every ingest batch that admitted at least one event
#[derive(Debug, Clone)]
pub struct IngestNotice {
    pub events: Arc<Vec<AnnotatedEvent>>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub capacity: i64,
    pub window_hours: i64,
    pub eta: EtaSettings,
    pub channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            window_hours: 24,
            eta: EtaSettings::default(),
            channel_capacity: 1024,
        }
    }
}

struct State {
    store: EventStore,
    index: Arc<GeofenceIndex>,
    reference: ReferenceData,
    shipments: Arc<Vec<ShipmentSnapshot>>,
    statuses: LocationStatusBoard,
}

impl State {
    fn rebuild_shipments(&mut self) {
        self.shipments = Arc::new(project_shipments(
            self.store.events(),
            &self.reference.legs,
            &self.reference.locations,
        ));
    }
}

pub struct Pipeline {
    state: RwLock<State>,
    notices: broadcast::Sender<IngestNotice>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        index: GeofenceIndex,
        reference: ReferenceData,
    ) -> Result<Self, StoreError> {
        let store = EventStore::new(settings.capacity)?;
        let (notices, _) = broadcast::channel(settings.channel_capacity.max(1));

        info!(
            capacity = store.capacity(),
            zones = index.len(),
            locations = reference.locations.len(),
            legs = reference.legs.len(),
            "Pipeline initialized"
        );

        let mut state = State {
            store,
            index: Arc::new(index),
            reference,
            shipments: Arc::new(Vec::new()),
            statuses: LocationStatusBoard::default(),
        };
        state.rebuild_shipments();

        Ok(Self {
            state: RwLock::new(state),
            notices,
            settings,
        })
    }

    /// Validate `config`, then load zones and reference tables from the
    /// configured paths. Unset paths start empty.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, BootstrapError> {
        config.validate()?;

        let index = match config.data.zones_path {
            Some(ref path) => GeofenceIndex::load(path)?,
            None => {
                warn!("No zones configured, every event resolves outside all zones");
                GeofenceIndex::default()
            }
        };

        let mut reference = ReferenceData::default();
        if config.data.locations_csv.is_some() || config.data.legs_csv.is_some() {
            let provider = CsvReferenceProvider::new(
                config.data.locations_csv.clone().unwrap_or_default(),
                config.data.legs_csv.clone().unwrap_or_default(),
            );
            reference = provider.load()?;
        }

        Ok(Self::new(config.settings(), index, reference)?)
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn ingest(&self, raws: Vec<RawEvent>) -> IngestOutcome {
        self.ingest_at(raws, now_millis())
    }

    /// Ingest a batch with an explicit clock. Timestamps that cannot be
    /// parsed resolve to `now_ms`.
    #[instrument(skip(self, raws), fields(count = raws.len()))]
    pub fn ingest_at(&self, raws: Vec<RawEvent>, now_ms: i64) -> IngestOutcome {
        let (outcome, size) = {
            let mut state = self.state.write();
            let index = Arc::clone(&state.index);
            let outcome = state.store.ingest(raws, &index, now_ms);
            if outcome.changed() {
                state.rebuild_shipments();
                // Sent under the write guard so subscribers see batches in
                // ingestion order. No subscribers is not an error.
                let _ = self.notices.send(IngestNotice {
                    events: Arc::new(outcome.admitted.clone()),
                });
            }
            (outcome, state.store.len())
        };

        metrics::counter!("pipeline_events_ingested_total").increment(outcome.admitted.len() as u64);
        metrics::counter!("pipeline_events_duplicate_total").increment(outcome.duplicates as u64);
        metrics::counter!("pipeline_events_dropped_total").increment(outcome.dropped as u64);
        metrics::counter!("pipeline_events_evicted_total").increment(outcome.evicted as u64);
        metrics::gauge!("pipeline_store_size").set(size as f64);

        debug!(
            admitted = outcome.admitted.len(),
            duplicates = outcome.duplicates,
            dropped = outcome.dropped,
            evicted = outcome.evicted,
            "Ingested batch"
        );

        outcome
    }

    /// Drop events with a timestamp strictly before `cutoff_ms`
    pub fn prune_older_than(&self, cutoff_ms: i64) -> usize {
        let (removed, size) = {
            let mut state = self.state.write();
            let removed = state.store.prune_older_than(cutoff_ms);
            if removed > 0 {
                state.rebuild_shipments();
            }
            (removed, state.store.len())
        };

        metrics::counter!("pipeline_events_pruned_total").increment(removed as u64);
        metrics::gauge!("pipeline_store_size").set(size as f64);
        if removed > 0 {
            info!(removed, cutoff_ms, "Pruned events outside window");
        }
        removed
    }

    /// Prune to the configured sliding window ending at `now_ms`
    pub fn prune_window(&self, now_ms: i64) -> usize {
        self.prune_older_than(window_cutoff(now_ms, self.settings.window_hours))
    }

    /// Swap in a new zone set. Stored events keep their classification.
    pub fn replace_zones(&self, index: GeofenceIndex) {
        let zones = index.len();
        self.state.write().index = Arc::new(index);
        info!(zones, "Replaced geofence index");
    }

    pub fn zones(&self) -> Arc<GeofenceIndex> {
        Arc::clone(&self.state.read().index)
    }

    pub fn set_locations(&self, locations: Vec<Location>) {
        let mut state = self.state.write();
        state.reference.locations = locations;
        state.rebuild_shipments();
    }

    pub fn set_legs(&self, legs: Vec<Leg>) {
        let mut state = self.state.write();
        state.reference.legs = legs;
        state.rebuild_shipments();
    }

    pub fn locations(&self) -> Vec<Location> {
        self.state.read().reference.locations.clone()
    }

    /// Stored events at or after `since_ms`, oldest insertion first
    pub fn events(&self, since_ms: Option<i64>) -> Vec<AnnotatedEvent> {
        let state = self.state.read();
        state
            .store
            .events()
            .iter()
            .filter(|e| since_ms.map_or(true, |s| e.ts_ms >= s))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shipments(&self) -> Arc<Vec<ShipmentSnapshot>> {
        Arc::clone(&self.state.read().shipments)
    }

    pub fn heatmap(&self, filter: &HeatmapFilter) -> Vec<HeatPoint> {
        project_heatmap(self.state.read().store.events(), filter)
    }

    pub fn eta_wedges(&self, now_ms: i64) -> Vec<EtaWedge> {
        let shipments = self.shipments();
        project_eta(&shipments, now_ms, &self.settings.eta)
    }

    pub fn events_count_by_location(&self, location_id: &str, since_ms: i64) -> usize {
        self.state.read().store.count_by_location(location_id, since_ms)
    }

    pub fn upsert_location_status(
        &self,
        update: LocationStatusUpdate,
        now_ms: i64,
    ) -> Result<LocationStatus, StatusError> {
        let mut state = self.state.write();
        let State {
            statuses, reference, ..
        } = &mut *state;
        statuses.upsert(update, &reference.locations, now_ms)
    }

    pub fn location_statuses(&self) -> Vec<LocationStatus> {
        self.state.read().statuses.all()
    }

    /// Receive an [`IngestNotice`] for every batch that changed the store
    pub fn subscribe(&self) -> broadcast::Receiver<IngestNotice> {
        self.notices.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use crate::geo::GeoPoint;
    use crate::geofence::{Zone, ZoneGeometry, ZoneKind};
    use crate::reference::TransportMode;

    fn square(id: &str, x: f64) -> Zone {
        let ring = vec![
            GeoPoint::new(x, 0.0),
            GeoPoint::new(x + 1.0, 0.0),
            GeoPoint::new(x + 1.0, 1.0),
            GeoPoint::new(x, 1.0),
            GeoPoint::new(x, 0.0),
        ];
        Zone::new(id, ZoneKind::Port, ZoneGeometry::Polygon(vec![ring]))
    }

    fn reference() -> ReferenceData {
        ReferenceData {
            locations: vec![Location {
                location_id: "NORTH".into(),
                kind: ZoneKind::Site,
                name: "North site".into(),
                lat: 1.0,
                lon: 0.0,
            }],
            legs: vec![Leg {
                leg_id: "L1".into(),
                shpt_no: "S1".into(),
                from_location_id: "NOWHERE".into(),
                to_location_id: "NORTH".into(),
                mode: TransportMode::Road,
                planned_etd: String::new(),
                planned_eta: String::new(),
            }],
        }
    }

    fn pipeline(capacity: i64) -> Pipeline {
        let settings = PipelineSettings {
            capacity,
            ..Default::default()
        };
        let index = GeofenceIndex::build(vec![square("Z1", 0.0), square("Z2", 2.0)]);
        Pipeline::new(settings, index, reference()).unwrap()
    }

    #[test]
    fn test_from_config_loads_files() {
        let dir = tempfile::tempdir().unwrap();
        let zones = dir.path().join("zones.geojson");
        std::fs::write(
            &zones,
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{"id":"Z1","kind":"PORT"},"geometry":{"type":"Polygon","coordinates":[[[0,0],[1,0],[1,1],[0,1],[0,0]]]}}]}"#,
        )
        .unwrap();
        let locations = dir.path().join("locations.csv");
        std::fs::write(&locations, "location_id,type,name,lat,lon\nNORTH,SITE,North,1.0,0.0\n").unwrap();

        let mut config = PipelineConfig::default();
        config.data.zones_path = Some(zones);
        config.data.locations_csv = Some(locations);

        let p = Pipeline::from_config(&config).unwrap();
        assert_eq!(p.zones().len(), 1);
        assert_eq!(p.locations().len(), 1);

        config.store.capacity = 0;
        assert!(matches!(Pipeline::from_config(&config), Err(BootstrapError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let settings = PipelineSettings {
            capacity: 0,
            ..Default::default()
        };
        assert!(Pipeline::new(settings, GeofenceIndex::default(), ReferenceData::default()).is_err());
    }

    #[test]
    fn test_ingest_rebuilds_shipments_and_wedges() {
        let p = pipeline(10);
        assert!(p.shipments().is_empty());

        p.ingest_at(
            vec![RawEvent::new("e1", GeoPoint::new(0.0, 0.0)).with_shipment("S1").with_ts(1_000)],
            5_000,
        );
        let shipments = p.shipments();
        assert_eq!(shipments.len(), 1);
        assert_eq!(shipments[0].speed_kph, 60.0);

        let wedges = p.eta_wedges(5_000);
        assert_eq!(wedges.len(), 1);
        assert!(wedges[0].bearing_deg < 1e-6);
    }

    #[test]
    fn test_prune_window_and_shipment_refresh() {
        let p = pipeline(10);
        let now = 100 * MS_PER_HOUR;
        p.ingest_at(
            vec![
                RawEvent::new("old", GeoPoint::new(5.0, 5.0)).with_shipment("S1").with_ts(now - 30 * MS_PER_HOUR),
                RawEvent::new("new", GeoPoint::new(5.0, 5.0)).with_shipment("S2").with_ts(now - MS_PER_HOUR),
            ],
            now,
        );
        assert_eq!(p.shipments().len(), 2);

        assert_eq!(p.prune_window(now), 1);
        assert_eq!(p.len(), 1);
        let shipments = p.shipments();
        assert_eq!(shipments.len(), 1);
        assert_eq!(shipments[0].shpt_no, "S2");

        assert_eq!(p.prune_older_than(i64::MIN), 0);
        assert_eq!(p.prune_older_than(i64::MAX), 1);
        assert!(p.is_empty());
        assert!(p.shipments().is_empty());
    }

    #[test]
    fn test_prune_window_saturates_for_wide_windows() {
        let settings = PipelineSettings {
            window_hours: i64::MAX / 1000,
            ..Default::default()
        };
        let p = Pipeline::new(settings, GeofenceIndex::default(), ReferenceData::default()).unwrap();
        p.ingest_at(vec![RawEvent::new("e1", GeoPoint::new(5.0, 5.0)).with_ts(0)], 0);

        assert_eq!(window_cutoff(1_000, i64::MAX / 1000), 1_000 - i64::MAX);
        assert_eq!(p.prune_window(1_000), 0);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_reference_changes_rebuild_snapshot() {
        let p = pipeline(10);
        p.ingest_at(vec![RawEvent::new("e1", GeoPoint::new(0.5, 0.5)).with_shipment("S1")], 0);
        assert_eq!(p.shipments()[0].legs.len(), 1);

        p.set_legs(Vec::new());
        assert!(p.shipments()[0].legs.is_empty());
        assert_eq!(p.shipments()[0].speed_kph, 40.0);
        assert!(p.eta_wedges(0).is_empty());

        p.set_locations(Vec::new());
        assert!(p.locations().is_empty());
    }

    #[test]
    fn test_replace_zones_keeps_stored_classification() {
        let p = pipeline(10);
        p.ingest_at(vec![RawEvent::new("e1", GeoPoint::new(0.5, 0.5)).with_tracker("T")], 0);
        p.replace_zones(GeofenceIndex::default());

        let events = p.events(None);
        assert_eq!(events[0].zone_id.as_deref(), Some("Z1"));
        assert!(p.zones().is_empty());

        // next ping resolves against the new (empty) zone set
        p.ingest_at(vec![RawEvent::new("e2", GeoPoint::new(0.5, 0.5)).with_tracker("T")], 0);
        assert_eq!(p.events(None)[1].event_type, EventType::Exit);
    }

    #[test]
    fn test_queries() {
        let p = pipeline(10);
        p.ingest_at(
            vec![
                RawEvent::new("a", GeoPoint::new(0.5, 0.5)).with_ts(10).with_meta("location_id", "NORTH"),
                RawEvent::new("b", GeoPoint::new(2.5, 0.5)).with_ts(20).with_meta("location_id", "NORTH"),
                RawEvent::new("c", GeoPoint::new(9.0, 9.0)).with_ts(30),
            ],
            0,
        );
        assert_eq!(p.events(Some(20)).len(), 2);
        assert_eq!(p.events_count_by_location("NORTH", 0), 2);
        assert_eq!(p.events_count_by_location("NORTH", 15), 1);

        let filter = HeatmapFilter {
            since_ms: 0,
            event_type: None,
            zone_id: Some("Z2".into()),
        };
        assert_eq!(p.heatmap(&filter).len(), 1);
    }

    #[test]
    fn test_location_status_roundtrip() {
        let p = pipeline(10);
        let now = 1_705_314_600_000;
        let stored = p
            .upsert_location_status(LocationStatusUpdate::new("NORTH", 0.95, now), now)
            .unwrap();
        assert_eq!(p.location_statuses(), vec![stored]);
        assert!(p
            .upsert_location_status(LocationStatusUpdate::new("SOUTH", 0.1, now), now)
            .is_err());
    }

    #[tokio::test]
    async fn test_notice_fired_only_for_changing_batches() {
        let p = pipeline(10);
        let mut rx = p.subscribe();

        let raw = RawEvent::new("e1", GeoPoint::new(0.5, 0.5)).with_shipment("S1");
        p.ingest_at(vec![raw.clone()], 0);
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.events.len(), 1);
        assert_eq!(notice.events[0].event_type, EventType::Enter);

        // duplicate and malformed only: no notice
        p.ingest_at(vec![raw, RawEvent::default()], 0);
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[test]
    fn test_notices_follow_ingestion_order_across_threads() {
        let p = Arc::new(pipeline(1000));
        let mut rx = p.subscribe();

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let p = Arc::clone(&p);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let raw = RawEvent::new(format!("w{w}-{i}"), GeoPoint::new(5.0, 5.0));
                        p.ingest_at(vec![raw], 0);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut notified = Vec::new();
        while let Ok(notice) = rx.try_recv() {
            notified.extend(notice.events.iter().map(|e| e.id.clone()));
        }
        let stored: Vec<String> = p.events(None).into_iter().map(|e| e.id).collect();
        assert_eq!(stored.len(), 200);
        assert_eq!(notified, stored);
    }
}
