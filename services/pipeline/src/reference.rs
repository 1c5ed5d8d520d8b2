//! Static reference tables: locations and planned shipment legs.
//!
//! These change rarely and are owned by an external provider. The pipeline
//! only reads them when deriving shipment snapshots.

use crate::geo::GeoPoint;
use crate::geofence::ZoneKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Fallback speed for shipments with no planned legs
pub const FALLBACK_SPEED_KPH: f64 = 40.0;

/// Errors that can occur while loading reference tables
#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("Failed to read {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// A named site with fixed coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub location_id: String,
    #[serde(rename = "type")]
    pub kind: ZoneKind,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lon, self.lat)
    }
}

/// Transport mode of a leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportMode {
    Road,
    Sea,
    Air,
}

impl TransportMode {
    /// Default cruising speed used when no explicit speed is reported
    pub fn default_speed_kph(&self) -> f64 {
        match self {
            TransportMode::Road => 60.0,
            TransportMode::Sea => 25.0,
            TransportMode::Air => 800.0,
        }
    }
}

/// One planned hop of a shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub leg_id: String,
    pub shpt_no: String,
    pub from_location_id: String,
    pub to_location_id: String,
    pub mode: TransportMode,
    #[serde(default)]
    pub planned_etd: String,
    #[serde(default)]
    pub planned_eta: String,
}

/// Snapshot of both reference tables
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub locations: Vec<Location>,
    pub legs: Vec<Leg>,
}

impl ReferenceData {
    pub fn locations_by_id(&self) -> HashMap<&str, &Location> {
        index_locations(&self.locations)
    }
}

pub(crate) fn index_locations(locations: &[Location]) -> HashMap<&str, &Location> {
    locations.iter().map(|l| (l.location_id.as_str(), l)).collect()
}

/// Source of reference tables
pub trait ReferenceProvider: Send + Sync {
    fn locations(&self) -> Result<Vec<Location>, ReferenceError>;

    fn legs(&self) -> Result<Vec<Leg>, ReferenceError>;

    fn load(&self) -> Result<ReferenceData, ReferenceError> {
        Ok(ReferenceData {
            locations: self.locations()?,
            legs: self.legs()?,
        })
    }
}

/// Reads `locations.csv` and `legs.csv` with header rows.
///
/// A missing file yields an empty table. Rows that fail to decode are
/// skipped with a warning.
#[derive(Debug, Clone)]
pub struct CsvReferenceProvider {
    locations_path: PathBuf,
    legs_path: PathBuf,
}

impl CsvReferenceProvider {
    pub fn new(locations_path: impl Into<PathBuf>, legs_path: impl Into<PathBuf>) -> Self {
        Self {
            locations_path: locations_path.into(),
            legs_path: legs_path.into(),
        }
    }

    /// `locations.csv` and `legs.csv` inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(dir.join("locations.csv"), dir.join("legs.csv"))
    }
}

impl ReferenceProvider for CsvReferenceProvider {
    fn locations(&self) -> Result<Vec<Location>, ReferenceError> {
        let rows: Vec<Location> = read_rows(&self.locations_path, "location")?;
        let total = rows.len();
        let valid: Vec<Location> = rows
            .into_iter()
            .filter(|l| {
                let ok = l.position().is_valid();
                if !ok {
                    warn!(location_id = %l.location_id, "Skipping location row with out-of-range coordinates");
                }
                ok
            })
            .collect();
        info!(path = %self.locations_path.display(), loaded = valid.len(), skipped = total - valid.len(), "Loaded locations");
        Ok(valid)
    }

    fn legs(&self) -> Result<Vec<Leg>, ReferenceError> {
        let legs: Vec<Leg> = read_rows(&self.legs_path, "leg")?;
        info!(path = %self.legs_path.display(), loaded = legs.len(), "Loaded legs");
        Ok(legs)
    }
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path, label: &str) -> Result<Vec<T>, ReferenceError> {
    if !path.exists() {
        warn!(path = %path.display(), "Reference file not found, using empty {} table", label);
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| ReferenceError::Csv {
            path: path.display().to_string(),
            source,
        })?;

    let mut out = Vec::new();
    for (line, row) in reader.deserialize::<T>().enumerate() {
        match row {
            Ok(item) => out.push(item),
            Err(e) => warn!(row = line + 1, error = %e, "Skipping {} row", label),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, body: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn test_default_speeds_by_mode() {
        assert_eq!(TransportMode::Road.default_speed_kph(), 60.0);
        assert_eq!(TransportMode::Sea.default_speed_kph(), 25.0);
        assert_eq!(TransportMode::Air.default_speed_kph(), 800.0);
    }

    #[test]
    fn test_csv_provider_loads_and_skips_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "locations.csv",
            "location_id,type,name,lat,lon\n\
             MOSB_ESNAAD,MOSB,Esnaad MOSB,24.328853,54.458570\n\
             BROKEN,AIRPORT,Nowhere,1,1\n\
             FAR,SITE,Off the map,95.0,10.0\n\
             WH_1, WH ,Main warehouse,24.4,54.5\n",
        );
        write_file(
            dir.path(),
            "legs.csv",
            "leg_id,shpt_no,from_location_id,to_location_id,mode,planned_etd,planned_eta\n\
             L1,SHPT-1,WH_1,MOSB_ESNAAD,ROAD,2024-01-01T00:00:00Z,2024-01-01T06:00:00Z\n\
             L2,SHPT-1,MOSB_ESNAAD,SITE_A,BOAT,,\n",
        );

        let data = CsvReferenceProvider::in_dir(dir.path()).load().unwrap();
        let ids: Vec<_> = data.locations.iter().map(|l| l.location_id.as_str()).collect();
        assert_eq!(ids, vec!["MOSB_ESNAAD", "WH_1"]);
        assert_eq!(data.locations[1].kind, ZoneKind::Warehouse);

        assert_eq!(data.legs.len(), 1);
        assert_eq!(data.legs[0].mode, TransportMode::Road);

        let by_id = data.locations_by_id();
        assert_eq!(by_id["WH_1"].position(), GeoPoint::new(54.5, 24.4));
    }

    #[test]
    fn test_missing_files_give_empty_tables() {
        let dir = tempfile::tempdir().unwrap();
        let data = CsvReferenceProvider::in_dir(dir.path()).load().unwrap();
        assert!(data.locations.is_empty());
        assert!(data.legs.is_empty());
    }
}
