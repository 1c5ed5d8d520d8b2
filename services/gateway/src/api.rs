use crate::config::ApiConfig;
use crate::ws::ws_events;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use mosb_pipeline::event::now_millis;
use mosb_pipeline::wire::EventRecord;
use mosb_pipeline::{
    decode_payload, AnnotatedEvent, EtaWedge, EventType, HeatPoint, HeatmapFilter, LocationStatus,
    LocationStatusUpdate, Pipeline, RawEvent, ShipmentSnapshot, StatusError, Timestamp, WireError, ZoneKind,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    /// Keep-alive cadence for `/ws/events`
    pub ping_interval: Duration,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Payload(#[from] WireError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Payload(_) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Status(StatusError::UnknownLocation(_)) => (StatusCode::NOT_FOUND, "UNKNOWN_LOCATION"),
            ApiError::Status(StatusError::OutOfOrder { .. }) => (StatusCode::CONFLICT, "OUT_OF_ORDER"),
            ApiError::Status(_) => (StatusCode::BAD_REQUEST, "INVALID_STATUS"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        warn!(error = %self, code, "Request rejected");
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SinceQuery {
    pub since_ms: Option<i64>,
}

/// Heatmap query. `all` or an empty value disables a filter.
#[derive(Debug, Default, Deserialize)]
pub struct HeatmapQuery {
    pub since_ms: Option<i64>,
    pub event_type: Option<String>,
    pub zone_id: Option<String>,
}

fn active(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
}

impl HeatmapQuery {
    fn into_filter(self) -> Result<HeatmapFilter, ApiError> {
        let event_type = active(self.event_type)
            .map(|t| t.parse::<EventType>())
            .transpose()
            .map_err(ApiError::BadRequest)?;
        Ok(HeatmapFilter {
            since_ms: self.since_ms.unwrap_or(0),
            event_type,
            zone_id: active(self.zone_id),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct EtaQuery {
    pub now_ms: Option<i64>,
}

/// Prune request. Without a cutoff the configured window is applied.
#[derive(Debug, Default, Deserialize)]
pub struct PruneRequest {
    pub cutoff_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub admitted: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub evicted: usize,
    pub stored: usize,
}

#[derive(Debug, Serialize)]
pub struct DemoResponse {
    pub ok: bool,
    pub event: Option<AnnotatedEvent>,
}

#[derive(Debug, Serialize)]
pub struct PruneResponse {
    pub pruned: usize,
    pub stored: usize,
}

#[derive(Debug, Serialize)]
pub struct ZoneSummary {
    pub id: String,
    pub kind: ZoneKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `[min_lon, min_lat, max_lon, max_lat]`; absent for degenerate zones
    pub bbox: Option<[f64; 4]>,
}

#[derive(Debug, Serialize)]
pub struct EventCountResponse {
    pub location_id: String,
    pub since_ms: i64,
    pub count: usize,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/events", get(list_events).post(ingest_events))
        .route("/api/v1/events/demo", post(demo_event))
        .route("/api/v1/events/prune", post(prune_events))
        .route("/api/v1/shipments", get(list_shipments))
        .route("/api/v1/heatmap", get(heatmap))
        .route("/api/v1/eta", get(eta_wedges))
        .route("/api/v1/zones", get(list_zones))
        .route(
            "/api/v1/location-status",
            get(list_location_status).post(upsert_location_status),
        )
        .route("/api/v1/locations/:location_id/events/count", get(count_location_events))
        .route("/ws/events", get(ws_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "mosb-gateway",
        "events": state.pipeline.len(),
        "zones": state.pipeline.zones().len(),
    }))
}

#[instrument(skip(state))]
async fn list_events(State(state): State<AppState>, Query(params): Query<SinceQuery>) -> Json<Vec<AnnotatedEvent>> {
    Json(state.pipeline.events(params.since_ms))
}

/// Ingest any accepted wire shape
#[instrument(skip(state, body), fields(bytes = body.len()))]
async fn ingest_events(State(state): State<AppState>, body: Bytes) -> Result<Json<IngestResponse>, ApiError> {
    let raws = decode_payload(&body)?;
    let outcome = state.pipeline.ingest(raws);
    Ok(Json(IngestResponse {
        admitted: outcome.admitted.len(),
        duplicates: outcome.duplicates,
        dropped: outcome.dropped,
        evicted: outcome.evicted,
        stored: state.pipeline.len(),
    }))
}

/// Synthetic IN_TRANSIT tick at the Esnaad yard
fn demo_record() -> EventRecord {
    let id = Uuid::new_v4().simple().to_string();
    EventRecord {
        event_id: format!("EV-{}", &id[..8]),
        ts: Some(Timestamp::from(Utc::now().to_rfc3339().as_str())),
        shpt_no: Some("SHPT-AGI-0001".to_string()),
        status: Some("IN_TRANSIT".to_string()),
        location_id: Some("MOSB_ESNAAD".to_string()),
        lat: 24.328853,
        lon: 54.458570,
        remark: Some("Demo tick".to_string()),
    }
}

#[instrument(skip(state))]
async fn demo_event(State(state): State<AppState>) -> Json<DemoResponse> {
    let raw = RawEvent::from(demo_record());
    let outcome = state.pipeline.ingest(vec![raw]);
    let event = outcome.admitted.into_iter().next();
    if let Some(ref e) = event {
        info!(event_id = %e.id, "Demo event ingested");
    }
    Json(DemoResponse {
        ok: event.is_some(),
        event,
    })
}

/// An empty body applies the configured window. A body that does not parse
/// is rejected rather than falling back to the window.
#[instrument(skip(state, body), fields(bytes = body.len()))]
async fn prune_events(State(state): State<AppState>, body: Bytes) -> Result<Json<PruneResponse>, ApiError> {
    let request: PruneRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PruneRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(format!("Invalid prune request: {e}")))?
    };
    let pruned = match request.cutoff_ms {
        Some(cutoff) => state.pipeline.prune_older_than(cutoff),
        None => state.pipeline.prune_window(now_millis()),
    };
    Ok(Json(PruneResponse {
        pruned,
        stored: state.pipeline.len(),
    }))
}

async fn list_shipments(State(state): State<AppState>) -> Json<Vec<ShipmentSnapshot>> {
    Json(state.pipeline.shipments().as_ref().clone())
}

#[instrument(skip(state))]
async fn heatmap(State(state): State<AppState>, Query(params): Query<HeatmapQuery>) -> Result<Json<Vec<HeatPoint>>, ApiError> {
    let filter = params.into_filter()?;
    Ok(Json(state.pipeline.heatmap(&filter)))
}

#[instrument(skip(state))]
async fn eta_wedges(State(state): State<AppState>, Query(params): Query<EtaQuery>) -> Json<Vec<EtaWedge>> {
    let now = params.now_ms.unwrap_or_else(now_millis);
    Json(state.pipeline.eta_wedges(now))
}

async fn list_zones(State(state): State<AppState>) -> Json<Vec<ZoneSummary>> {
    let zones = state.pipeline.zones();
    let summaries = zones
        .zones()
        .iter()
        .map(|z| ZoneSummary {
            id: z.zone.id.clone(),
            kind: z.zone.kind,
            name: z.zone.name.clone(),
            bbox: (!z.bbox.is_empty()).then(|| [z.bbox.min_lon, z.bbox.min_lat, z.bbox.max_lon, z.bbox.max_lat]),
        })
        .collect();
    Json(summaries)
}

async fn list_location_status(State(state): State<AppState>) -> Json<Vec<LocationStatus>> {
    Json(state.pipeline.location_statuses())
}

#[instrument(skip(state))]
async fn upsert_location_status(
    State(state): State<AppState>,
    Json(update): Json<LocationStatusUpdate>,
) -> Result<Json<LocationStatus>, ApiError> {
    let status = state.pipeline.upsert_location_status(update, now_millis())?;
    Ok(Json(status))
}

#[instrument(skip(state))]
async fn count_location_events(
    State(state): State<AppState>,
    Path(location_id): Path<String>,
    Query(params): Query<SinceQuery>,
) -> Json<EventCountResponse> {
    let since_ms = params.since_ms.unwrap_or(0);
    let count = state.pipeline.events_count_by_location(&location_id, since_ms);
    Json(EventCountResponse {
        location_id,
        since_ms,
        count,
    })
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting gateway API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router).await.context("API server error")?;

    Ok(())
}
