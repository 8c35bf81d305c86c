//! Learner status and control
//!
//! Proposing, evaluating and resuming normally happen on the learning loop;
//! these endpoints let an operator drive the same transitions by hand.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::error::ApiResult;
use crate::learner::{GateDecision, LearnerStatus};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ProposeResponse {
    pub candidate_version: u64,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub resumed: bool,
}

/// GET /learner
pub async fn learner_status(State(state): State<AppState>) -> Json<LearnerStatus> {
    Json(state.service.learner().status().await)
}

/// POST /learner/propose
pub async fn propose(State(state): State<AppState>) -> ApiResult<Json<ProposeResponse>> {
    let candidate = state.service.learner().propose().await?;
    Ok(Json(ProposeResponse {
        candidate_version: candidate.version(),
    }))
}

/// POST /learner/evaluate
///
/// A staged regression answers 409 after the rollback has been applied.
pub async fn evaluate(State(state): State<AppState>) -> ApiResult<Json<GateDecision>> {
    Ok(Json(state.service.learner().evaluate().await?))
}

/// POST /learner/resume
pub async fn resume(State(state): State<AppState>) -> ApiResult<Json<ResumeResponse>> {
    let resumed = state.service.learner().resume().await?;
    Ok(Json(ResumeResponse { resumed }))
}

pub fn learner_routes() -> Router<AppState> {
    Router::new()
        .route("/learner", get(learner_status))
        .route("/learner/propose", post(propose))
        .route("/learner/evaluate", post(evaluate))
        .route("/learner/resume", post(resume))
}
