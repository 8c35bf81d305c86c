//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use sigscan_common::events::BreakerState;
use std::collections::BTreeMap;

use crate::cache::CacheStats;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while any source circuit is open
    pub status: String,
    pub module: String,
    pub version: String,
    pub git_hash: String,
    pub build_profile: String,
    pub uptime_seconds: u64,
    pub identifiers: usize,
    pub sources: BTreeMap<String, BreakerState>,
    pub cache: CacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let service = &state.service;
    let sources: BTreeMap<String, BreakerState> = service
        .source_health()
        .into_iter()
        .map(|(id, breaker)| (id.to_string(), breaker))
        .collect();
    let degraded = sources.values().any(|s| *s == BreakerState::Open);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        module: "sigscan-engine".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
        uptime_seconds: service.uptime_seconds(),
        identifiers: service.universe().len(),
        sources,
        cache: service.cache().stats(),
        last_error: service.last_error(),
    })
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
