//! Geofence zones and the point-to-zone index.
//!
//! A [`GeofenceIndex`] is built once per zone-set update and never mutated.
//! Queries scan zones in input order, rejecting on the precomputed bounding
//! box before running the exact polygon test. The first zone that contains
//! the point wins.

use crate::geo::GeoPoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while building an index from external zone definitions
#[derive(Error, Debug)]
pub enum GeofenceError {
    #[error("Zone definitions must be a GeoJSON FeatureCollection")]
    NotACollection,

    #[error("Failed to read zone file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse zone definitions: {0}")]
    Json(#[from] serde_json::Error),
}

/// Closed set of zone categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneKind {
    #[serde(rename = "MOSB")]
    Mosb,
    #[serde(rename = "SITE")]
    Site,
    #[serde(rename = "WH", alias = "WAREHOUSE")]
    Warehouse,
    #[serde(rename = "PORT")]
    Port,
    #[serde(rename = "BERTH")]
    Berth,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Mosb => "MOSB",
            ZoneKind::Site => "SITE",
            ZoneKind::Warehouse => "WH",
            ZoneKind::Port => "PORT",
            ZoneKind::Berth => "BERTH",
        }
    }
}

impl std::str::FromStr for ZoneKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MOSB" => Ok(ZoneKind::Mosb),
            "SITE" => Ok(ZoneKind::Site),
            "WH" | "WAREHOUSE" => Ok(ZoneKind::Warehouse),
            "PORT" => Ok(ZoneKind::Port),
            "BERTH" => Ok(ZoneKind::Berth),
            other => Err(format!("unknown zone kind: {other}")),
        }
    }
}

/// A linear ring of vertices. GeoJSON rings repeat the first vertex at the
/// end; open rings are treated as implicitly closed.
pub type Ring = Vec<GeoPoint>;

/// Polygon as an outer ring followed by zero or more holes.
pub type PolygonRings = Vec<Ring>;

/// Zone boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum ZoneGeometry {
    Polygon(PolygonRings),
    MultiPolygon(Vec<PolygonRings>),
}

impl ZoneGeometry {
    fn polygons(&self) -> impl Iterator<Item = &PolygonRings> {
        let parts: &[PolygonRings] = match self {
            ZoneGeometry::Polygon(rings) => std::slice::from_ref(rings),
            ZoneGeometry::MultiPolygon(polys) => polys.as_slice(),
        };
        parts.iter()
    }

    /// Exact containment. Points on an outer boundary count as inside;
    /// points on a hole boundary are not excluded by that hole.
    pub fn contains(&self, p: GeoPoint) -> bool {
        self.polygons().any(|rings| polygon_contains(rings, p))
    }
}

/// Axis-aligned bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    /// The empty box. Contains nothing and is the identity for [`extend`](Self::extend).
    pub const EMPTY: BoundingBox = BoundingBox {
        min_lon: f64::INFINITY,
        min_lat: f64::INFINITY,
        max_lon: f64::NEG_INFINITY,
        max_lat: f64::NEG_INFINITY,
    };

    /// Bounding box over every finite vertex of every ring. Non-finite
    /// vertices are skipped; a geometry with none left stays [`EMPTY`](Self::EMPTY).
    pub fn of(geometry: &ZoneGeometry) -> Self {
        let mut bbox = Self::EMPTY;
        for rings in geometry.polygons() {
            for ring in rings {
                for v in ring.iter().filter(|v| v.is_finite()) {
                    bbox.extend(*v);
                }
            }
        }
        bbox
    }

    pub fn extend(&mut self, p: GeoPoint) {
        self.min_lon = self.min_lon.min(p.lon);
        self.min_lat = self.min_lat.min(p.lat);
        self.max_lon = self.max_lon.max(p.lon);
        self.max_lat = self.max_lat.max(p.lat);
    }

    pub fn is_empty(&self) -> bool {
        self.min_lon > self.max_lon || self.min_lat > self.max_lat
    }

    /// Inclusive on all edges.
    pub fn contains(&self, p: GeoPoint) -> bool {
        p.lon >= self.min_lon && p.lon <= self.max_lon && p.lat >= self.min_lat && p.lat <= self.max_lat
    }
}

/// A named polygonal region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub kind: ZoneKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub geometry: ZoneGeometry,
}

impl Zone {
    pub fn new(id: impl Into<String>, kind: ZoneKind, geometry: ZoneGeometry) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            geometry,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Result of a successful zone lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneMatch {
    pub zone_id: String,
    pub zone_kind: ZoneKind,
}

/// A zone together with its precomputed bounding box
#[derive(Debug, Clone, Serialize)]
pub struct IndexedZone {
    pub zone: Zone,
    pub bbox: BoundingBox,
}

/// Immutable ordered zone index
#[derive(Debug, Clone, Default)]
pub struct GeofenceIndex {
    items: Vec<IndexedZone>,
}

impl GeofenceIndex {
    /// Index `zones`, preserving their order for tie-breaks.
    pub fn build(zones: impl IntoIterator<Item = Zone>) -> Self {
        let items: Vec<IndexedZone> = zones
            .into_iter()
            .map(|zone| {
                let bbox = BoundingBox::of(&zone.geometry);
                if bbox.is_empty() {
                    warn!(zone_id = %zone.id, "Zone has no finite vertices and will never match");
                }
                IndexedZone { zone, bbox }
            })
            .collect();

        debug!(zones = items.len(), "Built geofence index");
        Self { items }
    }

    /// Build from a GeoJSON `FeatureCollection`.
    ///
    /// Features that cannot be decoded into a [`Zone`] are skipped.
    pub fn from_geojson(collection: &Value) -> Result<Self, GeofenceError> {
        let is_collection = collection.get("type").and_then(Value::as_str) == Some("FeatureCollection");
        let features = match collection.get("features").and_then(Value::as_array) {
            Some(features) if is_collection => features,
            _ => return Err(GeofenceError::NotACollection),
        };

        let zones = features.iter().enumerate().filter_map(|(i, feature)| {
            let zone = zone_from_feature(feature);
            if zone.is_none() {
                warn!(feature_index = i, "Skipping undecodable zone feature");
            }
            zone
        });

        Ok(Self::build(zones.collect::<Vec<_>>()))
    }

    /// Read and index a GeoJSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeofenceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| GeofenceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let value: Value = serde_json::from_str(&text)?;
        let index = Self::from_geojson(&value)?;
        info!(path = %path.display(), zones = index.len(), "Loaded geofence zones");
        Ok(index)
    }

    /// First zone, in input order, whose polygon contains `point`.
    pub fn find_zone(&self, point: GeoPoint) -> Option<ZoneMatch> {
        if !point.is_finite() {
            return None;
        }
        self.items
            .iter()
            .filter(|it| it.bbox.contains(point))
            .find(|it| it.zone.geometry.contains(point))
            .map(|it| ZoneMatch {
                zone_id: it.zone.id.clone(),
                zone_kind: it.zone.kind,
            })
    }

    pub fn zones(&self) -> &[IndexedZone] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn zone_from_feature(feature: &Value) -> Option<Zone> {
    let props = feature.get("properties")?;
    let id = props.get("id").and_then(Value::as_str)?.to_string();
    let kind: ZoneKind = props.get("kind").and_then(Value::as_str)?.parse().ok()?;
    let name = props.get("name").and_then(Value::as_str).map(str::to_string);

    let geometry = feature.get("geometry")?;
    let coords = geometry.get("coordinates")?;
    let geometry = match geometry.get("type").and_then(Value::as_str)? {
        "Polygon" => ZoneGeometry::Polygon(parse_polygon(coords)?),
        "MultiPolygon" => ZoneGeometry::MultiPolygon(
            coords
                .as_array()?
                .iter()
                .map(parse_polygon)
                .collect::<Option<Vec<_>>>()?,
        ),
        _ => return None,
    };

    Some(Zone {
        id,
        kind,
        name,
        geometry,
    })
}

fn parse_polygon(value: &Value) -> Option<PolygonRings> {
    value
        .as_array()?
        .iter()
        .map(|ring| ring.as_array()?.iter().map(parse_position).collect())
        .collect()
}

/// `[lng, lat, ...]`; extra ordinates such as altitude are ignored.
fn parse_position(value: &Value) -> Option<GeoPoint> {
    let arr = value.as_array()?;
    match (arr.first()?.as_f64(), arr.get(1)?.as_f64()) {
        (Some(lon), Some(lat)) => Some(GeoPoint::new(lon, lat)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingPosition {
    Inside,
    Boundary,
    Outside,
}

fn polygon_contains(rings: &[Ring], p: GeoPoint) -> bool {
    let Some((outer, holes)) = rings.split_first() else {
        return false;
    };
    if ring_position(outer, p) == RingPosition::Outside {
        return false;
    }
    !holes.iter().any(|hole| ring_position(hole, p) == RingPosition::Inside)
}

/// Even-odd ray casting with an explicit on-edge check. Edges touching a
/// non-finite vertex are ignored.
fn ring_position(ring: &[GeoPoint], p: GeoPoint) -> RingPosition {
    if ring.len() < 3 {
        return RingPosition::Outside;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        j = i;
        if !a.is_finite() || !b.is_finite() {
            continue;
        }
        if on_segment(a, b, p) {
            return RingPosition::Boundary;
        }
        if (a.lat > p.lat) != (b.lat > p.lat) {
            let x = a.lon + (p.lat - a.lat) * (b.lon - a.lon) / (b.lat - a.lat);
            if p.lon < x {
                inside = !inside;
            }
        }
    }

    if inside {
        RingPosition::Inside
    } else {
        RingPosition::Outside
    }
}

fn on_segment(a: GeoPoint, b: GeoPoint, p: GeoPoint) -> bool {
    const EPS: f64 = 1e-12;
    let cross = (b.lon - a.lon) * (p.lat - a.lat) - (b.lat - a.lat) * (p.lon - a.lon);
    if cross.abs() > EPS {
        return false;
    }
    p.lon >= a.lon.min(b.lon) - EPS
        && p.lon <= a.lon.max(b.lon) + EPS
        && p.lat >= a.lat.min(b.lat) - EPS
        && p.lat <= a.lat.max(b.lat) + EPS
}
