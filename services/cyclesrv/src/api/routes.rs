//! REST control surface
//!
//! Monitoring control, station status, scan submission, and manual reprint.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use errors::ServiceErrorTrait;
use tracing::info;

use crate::config::ServiceConfig;
use crate::core::monitor::MonitorRegistry;
use crate::core::printer::LabelDispatcher;
use crate::core::scan::ScanMatcher;
use crate::error::CycleSrvError;

use super::models::{
    HealthResponse, MonitoringAck, ReprintResponse, ScanRequest, ScanResponse,
    StationStatusResponse,
};

impl IntoResponse for CycleSrvError {
    fn into_response(self) -> Response {
        self.into_http_response()
    }
}

/// Shared API state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub registry: Arc<MonitorRegistry>,
    pub matcher: Arc<ScanMatcher>,
}

/// Build the API router
pub fn create_api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stations", get(list_stations))
        .route("/api/stations/{id}/status", get(station_status))
        .route("/api/stations/{id}/monitoring/start", post(start_monitoring))
        .route("/api/stations/{id}/monitoring/stop", post(stop_monitoring))
        .route("/api/scan", post(submit_scan))
        .route("/api/cycles/{code}/print", post(reprint_cycle))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.config.service.name.clone(),
        stations: state.registry.stations().len(),
    })
}

async fn list_stations(State(state): State<AppState>) -> Json<Vec<StationStatusResponse>> {
    Json(state.registry.statuses())
}

async fn station_status(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<StationStatusResponse>, CycleSrvError> {
    Ok(Json(state.registry.status(id)?))
}

async fn start_monitoring(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<MonitoringAck>, CycleSrvError> {
    state.registry.start_monitoring(id).await?;
    Ok(Json(MonitoringAck {
        station_id: id,
        monitoring_enabled: true,
    }))
}

async fn stop_monitoring(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<MonitoringAck>, CycleSrvError> {
    state.registry.stop_monitoring(id).await?;
    Ok(Json(MonitoringAck {
        station_id: id,
        monitoring_enabled: false,
    }))
}

async fn submit_scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, CycleSrvError> {
    let resolution = state
        .matcher
        .resolve_scan(&request.payload, request.scanner_id)
        .await?;
    info!(
        "Scan resolved: {:?} ({})",
        resolution.outcome, resolution.message
    );
    Ok(Json(resolution))
}

async fn reprint_cycle(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<ReprintResponse>, CycleSrvError> {
    let store = state.registry.store();
    let record = store
        .find_cycle_by_code(&code)
        .await?
        .ok_or_else(|| CycleSrvError::cycle_not_found(&code))?;

    let station = state
        .config
        .station(record.station_id)
        .ok_or_else(|| CycleSrvError::station_not_found(record.station_id))?;
    let printer = station.printer.as_ref().ok_or_else(|| {
        CycleSrvError::validation(format!("Station {} has no printer configured", station.code))
    })?;

    let identity = station.label_for_variant(None);
    let print_state =
        LabelDispatcher::dispatch(Some(printer), store.as_ref(), &record, &identity).await;

    Ok(Json(ReprintResponse {
        cycle_number: record.cycle_number,
        code: record.code,
        print_state,
    }))
}
