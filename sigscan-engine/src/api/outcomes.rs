//! Outcome feed endpoint

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use sigscan_common::human_time::serde_duration;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::types::{Identifier, OutcomeRecord};
use crate::AppState;

/// POST /outcomes request
#[derive(Debug, Deserialize)]
pub struct RecordOutcomeRequest {
    pub identifier: Identifier,
    pub scan_id: Uuid,
    pub realized_return: f64,
    /// Human-readable, e.g. "5d"
    #[serde(with = "serde_duration")]
    pub horizon: Duration,
}

/// POST /outcomes
pub async fn record_outcome(
    State(state): State<AppState>,
    Json(request): Json<RecordOutcomeRequest>,
) -> ApiResult<Json<OutcomeRecord>> {
    let record = state
        .service
        .record_outcome(&request.identifier, request.scan_id, request.realized_return, request.horizon)
        .await?;
    Ok(Json(record))
}

pub fn outcome_routes() -> Router<AppState> {
    Router::new().route("/outcomes", post(record_outcome))
}
