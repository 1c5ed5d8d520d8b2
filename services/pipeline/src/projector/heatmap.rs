use crate::event::{status, AnnotatedEvent, EventType};
use crate::geo::GeoPoint;
use serde::{Deserialize, Serialize};

const ENTER_BOOST: f64 = 1.5;
const EXIT_BOOST: f64 = 1.2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeatmapFilter {
    #[serde(default)]
    pub since_ms: i64,
    #[serde(default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub zone_id: Option<String>,
}

impl HeatmapFilter {
    pub fn since(since_ms: i64) -> Self {
        Self {
            since_ms,
            ..Default::default()
        }
    }

    fn accepts(&self, e: &AnnotatedEvent) -> bool {
        e.ts_ms >= self.since_ms
            && self.event_type.map_or(true, |t| t == e.event_type)
            && self
                .zone_id
                .as_deref()
                .map_or(true, |z| e.zone_id.as_deref() == Some(z))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatPoint {
    pub position: GeoPoint,
    pub weight: u8,
}

/// Base weight by status, most urgent first.
fn status_weight(status: Option<&str>) -> f64 {
    match status {
        Some(status::DELAYED) => 5.0,
        Some(status::HOLD) => 3.0,
        Some(status::IN_TRANSIT) => 2.0,
        _ => 1.0,
    }
}

/// Status weight boosted by transition type, rounded then clamped to `1..=255`.
pub fn heat_weight(event: &AnnotatedEvent) -> u8 {
    let boost = match event.event_type {
        EventType::Enter => ENTER_BOOST,
        EventType::Exit => EXIT_BOOST,
        EventType::Move => 1.0,
    };
    let w = (status_weight(event.status()) * boost).round();
    w.clamp(1.0, 255.0) as u8
}

pub fn project_heatmap<'a>(events: impl IntoIterator<Item = &'a AnnotatedEvent>, filter: &HeatmapFilter) -> Vec<HeatPoint> {
    events
        .into_iter()
        .filter(|e| filter.accepts(e))
        .map(|e| HeatPoint {
            position: e.position,
            weight: heat_weight(e),
        })
        .collect()
}
