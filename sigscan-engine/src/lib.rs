//! sigscan-engine library interface
//!
//! Exposes the scanner components and the HTTP router for the service
//! binary and for integration testing.

pub mod api;
pub mod cache;
pub mod db;
pub mod error;
pub mod fetch;
pub mod learner;
pub mod orchestrator;
pub mod outcomes;
pub mod scoring;
pub mod service;
pub mod types;
pub mod universe;
pub mod upstream;

pub use crate::error::{ApiError, ApiResult};
pub use crate::service::ScannerService;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScannerService>,
}

impl AppState {
    pub fn new(service: Arc<ScannerService>) -> Self {
        Self { service }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::scan_routes())
        .merge(api::outcome_routes())
        .merge(api::weight_routes())
        .merge(api::learner_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
