use crate::event::{millis_to_rfc3339, status, AnnotatedEvent};
use crate::geo::GeoPoint;
use crate::reference::{index_locations, Leg, Location, TransportMode, FALLBACK_SPEED_KPH};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One end of a planned leg, resolved against the location table.
///
/// `position` is `None` when the location id is unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegEndpoint {
    pub location_id: String,
    pub name: Option<String>,
    pub position: Option<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegSnapshot {
    pub leg_id: String,
    pub mode: TransportMode,
    pub from: LegEndpoint,
    pub to: LegEndpoint,
    pub speed_kph: f64,
    pub planned_etd: String,
    pub planned_eta: String,
}

/// Current state of one shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentSnapshot {
    pub shpt_no: String,
    pub status: String,
    pub position: GeoPoint,
    pub speed_kph: f64,
    pub legs: Vec<LegSnapshot>,
    pub updated_at_ms: i64,
    pub updated_at: String,
}

/// Latest event per shipment, joined with its planned legs.
///
/// Recency is insertion order: the scan runs newest to oldest and keeps the
/// first event seen for each shipment number. Events without a shipment
/// number are ignored. Output is ordered newest shipment first.
pub fn project_shipments<'a, I>(events: I, legs: &[Leg], locations: &[Location]) -> Vec<ShipmentSnapshot>
where
    I: IntoIterator<Item = &'a AnnotatedEvent>,
    I::IntoIter: DoubleEndedIterator,
{
    let by_id = index_locations(locations);
    let endpoint = |location_id: &str| {
        let loc = by_id.get(location_id);
        LegEndpoint {
            location_id: location_id.to_string(),
            name: loc.map(|l| l.name.clone()),
            position: loc.map(|l| l.position()),
        }
    };

    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();

    for event in events.into_iter().rev() {
        let Some(shpt_no) = event.shpt_no.as_deref() else {
            continue;
        };
        if !seen.insert(shpt_no) {
            continue;
        }

        let shipment_legs: Vec<LegSnapshot> = legs
            .iter()
            .filter(|l| l.shpt_no == shpt_no)
            .map(|l| LegSnapshot {
                leg_id: l.leg_id.clone(),
                mode: l.mode,
                from: endpoint(&l.from_location_id),
                to: endpoint(&l.to_location_id),
                speed_kph: l.mode.default_speed_kph(),
                planned_etd: l.planned_etd.clone(),
                planned_eta: l.planned_eta.clone(),
            })
            .collect();

        let speed_kph = event
            .speed_kph()
            .or_else(|| shipment_legs.first().map(|l| l.speed_kph))
            .unwrap_or(FALLBACK_SPEED_KPH);

        out.push(ShipmentSnapshot {
            shpt_no: shpt_no.to_string(),
            status: event.status().unwrap_or(status::IN_TRANSIT).to_string(),
            position: event.position,
            speed_kph,
            legs: shipment_legs,
            updated_at_ms: event.ts_ms,
            updated_at: millis_to_rfc3339(event.ts_ms),
        });
    }

    out
}
