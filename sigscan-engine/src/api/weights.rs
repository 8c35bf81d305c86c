//! Weight vector inspection

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ApiError, ApiResult};
use crate::learner::RolloutStage;
use crate::types::WeightVector;
use crate::AppState;

/// GET /weights/active response
#[derive(Debug, Serialize)]
pub struct ActiveWeightsResponse {
    pub active: WeightVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<WeightVector>,
    pub stage: RolloutStage,
    pub rollout_percent: u8,
    pub frozen: bool,
    pub published_at: DateTime<Utc>,
}

/// GET /weights/active
pub async fn active_weights(State(state): State<AppState>) -> Json<ActiveWeightsResponse> {
    let published = state.service.learner().snapshot();
    Json(ActiveWeightsResponse {
        active: published.active.as_ref().clone(),
        candidate: published.candidate.as_deref().cloned(),
        stage: published.stage,
        rollout_percent: published.rollout_percent,
        frozen: published.frozen,
        published_at: published.published_at,
    })
}

/// GET /weights/:version
pub async fn weight_version(State(state): State<AppState>, Path(version): Path<u64>) -> ApiResult<Json<WeightVector>> {
    state
        .service
        .learner()
        .resolve(version)
        .map(|v| Json(v.as_ref().clone()))
        .ok_or_else(|| ApiError::NotFound(format!("weight version {}", version)))
}

pub fn weight_routes() -> Router<AppState> {
    Router::new()
        .route("/weights/active", get(active_weights))
        .route("/weights/:version", get(weight_version))
}
