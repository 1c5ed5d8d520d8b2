//! MOSB Pipeline - live shipment event processing
//!
//! Ingests position-tagged shipment events, classifies each against a set of
//! named zones, keeps a bounded de-duplicated history and derives live
//! projections from it:
//!
//! - Zone transitions (`enter` / `exit` / `move`) per tracked entity
//! - Current shipment snapshots joined with planned legs
//! - A weighted heatmap
//! - Forward-looking ETA uncertainty wedges
//!
//! # Example
//!
//! ```rust,no_run
//! use mosb_pipeline::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let index = GeofenceIndex::load("data/zones.geojson")?;
//!     let reference = CsvReferenceProvider::in_dir("data").load()?;
//!     let pipeline = Pipeline::new(PipelineSettings::default(), index, reference)?;
//!
//!     pipeline.ingest(vec![RawEvent::new("ev-1", GeoPoint::new(54.45, 24.33)).with_shipment("SHPT-1")]);
//!     for wedge in pipeline.eta_wedges(now_millis()) {
//!         println!("{} heading {:.0}°", wedge.shpt_no, wedge.bearing_deg);
//!     }
//!     Ok(())
//! }
//! ```

pub mod annotator;
pub mod config;
pub mod consumer;
pub mod event;
pub mod geo;
pub mod geofence;
pub mod location_status;
pub mod pipeline;
pub mod producer;
pub mod projector;
pub mod reference;
pub mod store;
pub mod wire;

// Re-export main types
pub use annotator::{annotate, classify, entity_key, EntityZoneState};
pub use config::{ConfigError, KafkaConfig, PipelineConfig};
pub use consumer::{ConsumerError, IncomingMessage, IngestHandler, MessageHandler, MessageMetadata};
pub use event::{AnnotatedEvent, EventType, RawEvent, Timestamp};
pub use geo::GeoPoint;
pub use geofence::{GeofenceError, GeofenceIndex, Zone, ZoneGeometry, ZoneKind, ZoneMatch};
pub use location_status::{LocationStatus, LocationStatusUpdate, StatusCode, StatusError};
pub use pipeline::{BootstrapError, IngestNotice, Pipeline, PipelineSettings};
pub use producer::{OutgoingMessage, ProducerError};
pub use projector::{EtaSettings, EtaWedge, HeatPoint, HeatmapFilter, ShipmentSnapshot};
pub use reference::{CsvReferenceProvider, Leg, Location, ReferenceData, ReferenceError, ReferenceProvider};
pub use store::{EventStore, IngestOutcome, StoreError};
pub use wire::{decode_payload, WireError};

#[cfg(feature = "kafka")]
pub use consumer::{ConsumerBuilder, EventConsumer};
#[cfg(feature = "kafka")]
pub use producer::{relay_annotated, EventProducer};

/// Async trait for message handlers (re-export for convenience)
pub use async_trait::async_trait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::PipelineConfig;
    pub use crate::consumer::{ConsumerError, IncomingMessage, IngestHandler, MessageHandler};
    pub use crate::event::{now_millis, AnnotatedEvent, EventType, RawEvent};
    pub use crate::geo::GeoPoint;
    pub use crate::geofence::{GeofenceIndex, Zone, ZoneKind};
    pub use crate::pipeline::{IngestNotice, Pipeline, PipelineSettings};
    pub use crate::projector::{EtaWedge, HeatPoint, HeatmapFilter, ShipmentSnapshot};
    pub use crate::reference::{CsvReferenceProvider, ReferenceProvider};
    pub use crate::wire::decode_payload;
    pub use async_trait::async_trait;
}
