//! Forward-looking uncertainty wedges.
//!
//! Each wedge is a closed fan: apex at the shipment's position, `steps`
//! points swept across `bearing ± spread_deg` at the uncertainty radius, then
//! back to the apex.

use super::shipment::ShipmentSnapshot;
use crate::event::status;
use crate::geo::{destination, initial_bearing_deg, GeoPoint};
use serde::{Deserialize, Serialize};

pub const MIN_RADIUS_M: f64 = 200.0;
pub const MAX_RADIUS_M: f64 = 15_000.0;
pub const MIN_ELEVATION_M: f64 = 200.0;
pub const MAX_ELEVATION_M: f64 = 2_500.0;

/// Elevation hint per minute of uncertainty
const ELEVATION_M_PER_MINUTE: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EtaSettings {
    /// Half-angle of the fan in degrees
    pub spread_deg: f64,
    /// Points on the arc
    pub steps: usize,
}

impl Default for EtaSettings {
    fn default() -> Self {
        Self {
            spread_deg: 20.0,
            steps: 9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtaWedge {
    pub id: String,
    pub shpt_no: String,
    pub apex: GeoPoint,
    pub bearing_deg: f64,
    pub uncertainty_m: f64,
    /// Rendering cue only
    pub elevation_m: f64,
    pub polygon: Vec<GeoPoint>,
}

/// Uncertainty window in minutes for a shipment status
pub fn uncertainty_minutes(status: &str) -> f64 {
    match status {
        status::DELAYED => 30.0,
        status::IN_TRANSIT => 15.0,
        _ => 10.0,
    }
}

/// Closed fan polygon around `bearing_deg`.
///
/// `steps == 0` yields only the apex twice; `steps == 1` puts the single arc
/// point on the bearing itself.
pub fn wedge_polygon(apex: GeoPoint, bearing_deg: f64, radius_m: f64, settings: &EtaSettings) -> Vec<GeoPoint> {
    let start = bearing_deg - settings.spread_deg;
    let span = 2.0 * settings.spread_deg;

    let mut points = Vec::with_capacity(settings.steps + 2);
    points.push(apex);
    match settings.steps {
        0 => {}
        1 => points.push(destination(apex, bearing_deg, radius_m)),
        n => {
            for i in 0..n {
                let t = i as f64 / (n - 1) as f64;
                points.push(destination(apex, start + span * t, radius_m));
            }
        }
    }
    points.push(apex);
    points
}

/// One wedge per shipment whose first leg has a resolved target.
///
/// `now_ms` is accepted for callers that schedule projections on a clock;
/// the wedge geometry does not depend on it.
pub fn project_eta(shipments: &[ShipmentSnapshot], _now_ms: i64, settings: &EtaSettings) -> Vec<EtaWedge> {
    shipments
        .iter()
        .filter_map(|s| {
            let target = s.legs.first()?.to.position?;
            let apex = s.position;

            let bearing_deg = initial_bearing_deg(apex, target);
            let minutes = uncertainty_minutes(&s.status);
            let speed_mps = s.speed_kph * 1000.0 / 3600.0;
            let uncertainty_m = (speed_mps * minutes * 60.0).clamp(MIN_RADIUS_M, MAX_RADIUS_M);
            let elevation_m = (minutes * ELEVATION_M_PER_MINUTE).clamp(MIN_ELEVATION_M, MAX_ELEVATION_M);

            Some(EtaWedge {
                id: format!("eta-{}", s.shpt_no),
                shpt_no: s.shpt_no.clone(),
                apex,
                bearing_deg,
                uncertainty_m,
                elevation_m,
                polygon: wedge_polygon(apex, bearing_deg, uncertainty_m, settings),
            })
        })
        .collect()
}
