//! Scan trigger endpoints
//!
//! POST /scans, GET /scans/:scan_id

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::types::{Identifier, ScanMode, ScanReport};
use crate::AppState;

/// POST /scans request
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartScanRequest {
    pub mode: ScanMode,
    /// Restrict the scan to these identifiers; the whole universe when absent
    pub identifiers: Option<Vec<Identifier>>,
}

/// POST /scans response
#[derive(Debug, Serialize, Deserialize)]
pub struct StartScanResponse {
    pub scan_id: Uuid,
}

/// POST /scans
///
/// Returns 202 Accepted; results are polled with GET /scans/:scan_id.
pub async fn start_scan(
    State(state): State<AppState>,
    Json(request): Json<StartScanRequest>,
) -> ApiResult<(StatusCode, Json<StartScanResponse>)> {
    let scan_id = state.service.run_scan(request.mode, request.identifiers)?;
    tracing::info!(scan_id = %scan_id, mode = request.mode.as_str(), "Scan accepted");
    Ok((StatusCode::ACCEPTED, Json(StartScanResponse { scan_id })))
}

/// GET /scans/:scan_id
pub async fn get_scan(State(state): State<AppState>, Path(scan_id): Path<Uuid>) -> ApiResult<Json<ScanReport>> {
    Ok(Json(state.service.get_results(scan_id).await?))
}

pub fn scan_routes() -> Router<AppState> {
    Router::new()
        .route("/scans", post(start_scan))
        .route("/scans/:scan_id", get(get_scan))
}
