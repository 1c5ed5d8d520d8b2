//! Read-only projections derived from the event store.
//!
//! Every projector is a pure function of its inputs. Results are rebuilt
//! wholesale on each call and never patched.

pub mod eta;
pub mod heatmap;
pub mod shipment;

pub use eta::{project_eta, EtaSettings, EtaWedge};
pub use heatmap::{project_heatmap, HeatPoint, HeatmapFilter};
pub use shipment::{project_shipments, LegEndpoint, LegSnapshot, ShipmentSnapshot};
