//! MOSB Gateway - HTTP and WebSocket surface over the event pipeline
//!
//! Pull-based projections (events, shipments, heatmap, ETA wedges, zones,
//! location status) are served over a JSON API; every ingest batch is
//! pushed to `/ws/events` subscribers.

pub mod api;
pub mod config;
pub mod ws;

pub use api::{create_router, start_api_server, AppState};
pub use config::GatewayConfig;
