//! Occupancy board per location with monotonic updates.

use crate::event::{millis_to_rfc3339, Timestamp};
use crate::reference::Location;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Tolerated clock skew for `last_updated`
pub const MAX_FUTURE_SKEW_MS: i64 = 5_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatusError {
    #[error("Unknown location_id: {0}")]
    UnknownLocation(String),

    #[error("occupancy_rate must be within [0, 1], got {0}")]
    OccupancyOutOfRange(f64),

    #[error("last_updated is not a valid ISO-8601 timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("last_updated is in the future: {0}")]
    FutureTimestamp(String),

    #[error("Out-of-order update for {location_id}: {incoming} is older than {stored}")]
    OutOfOrder {
        location_id: String,
        incoming: String,
        stored: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    Ok,
    Warning,
    Critical,
}

impl StatusCode {
    pub fn from_occupancy(rate: f64) -> Self {
        if rate >= 0.9 {
            StatusCode::Critical
        } else if rate >= 0.7 {
            StatusCode::Warning
        } else {
            StatusCode::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationStatusUpdate {
    pub location_id: String,
    pub occupancy_rate: f64,
    #[serde(default)]
    pub status_code: Option<StatusCode>,
    pub last_updated: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationStatus {
    pub location_id: String,
    pub occupancy_rate: f64,
    pub status_code: StatusCode,
    pub last_updated: String,
    pub last_updated_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LocationStatusBoard {
    statuses: BTreeMap<String, LocationStatus>,
}

impl LocationStatusBoard {
    /// Validate `update` and store it. An update carrying the same
    /// timestamp as the stored one replaces it.
    pub fn upsert(
        &mut self,
        update: LocationStatusUpdate,
        locations: &[Location],
        now_ms: i64,
    ) -> Result<LocationStatus, StatusError> {
        if !locations.iter().any(|l| l.location_id == update.location_id) {
            return Err(StatusError::UnknownLocation(update.location_id));
        }
        if !(0.0..=1.0).contains(&update.occupancy_rate) {
            return Err(StatusError::OccupancyOutOfRange(update.occupancy_rate));
        }

        let ts_ms = Timestamp::Text(update.last_updated.clone())
            .epoch_millis()
            .ok_or_else(|| StatusError::InvalidTimestamp(update.last_updated.clone()))?;
        if ts_ms > now_ms + MAX_FUTURE_SKEW_MS {
            return Err(StatusError::FutureTimestamp(update.last_updated));
        }

        if let Some(existing) = self.statuses.get(&update.location_id) {
            if ts_ms < existing.last_updated_ms {
                return Err(StatusError::OutOfOrder {
                    location_id: update.location_id,
                    incoming: update.last_updated,
                    stored: existing.last_updated.clone(),
                });
            }
        }

        let record = LocationStatus {
            status_code: update
                .status_code
                .unwrap_or_else(|| StatusCode::from_occupancy(update.occupancy_rate)),
            location_id: update.location_id,
            occupancy_rate: update.occupancy_rate,
            last_updated: update.last_updated,
            last_updated_ms: ts_ms,
        };
        self.statuses.insert(record.location_id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, location_id: &str) -> Option<&LocationStatus> {
        self.statuses.get(location_id)
    }

    /// All statuses ordered by location id
    pub fn all(&self) -> Vec<LocationStatus> {
        self.statuses.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

impl LocationStatusUpdate {
    pub fn new(location_id: impl Into<String>, occupancy_rate: f64, last_updated_ms: i64) -> Self {
        Self {
            location_id: location_id.into(),
            occupancy_rate,
            status_code: None,
            last_updated: millis_to_rfc3339(last_updated_ms),
        }
    }
}
