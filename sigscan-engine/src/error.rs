//! Error types for the HTTP surface

use crate::types::ScanError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), e.g. an outcome recorded twice or a busy learner
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Scan(#[from] ScanError),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Scan(err) => match err {
                ScanError::UnknownScan(_) | ScanError::UnknownEmission { .. } => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                ScanError::InvalidInput(_) | ScanError::Weights(_) | ScanError::DataValidation(_) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST")
                }
                ScanError::HorizonNotElapsed { .. } => (StatusCode::CONFLICT, "HORIZON_NOT_ELAPSED"),
                ScanError::DuplicateOutcome { .. } => (StatusCode::CONFLICT, "DUPLICATE_OUTCOME"),
                ScanError::LearnerBusy(_) => (StatusCode::CONFLICT, "LEARNER_BUSY"),
                ScanError::LearnerRegression { .. } => (StatusCode::CONFLICT, "LEARNER_REGRESSION"),
                ScanError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR"),
                ScanError::TransientFetch { .. }
                | ScanError::RateLimitExceeded { .. }
                | ScanError::UpstreamUnavailable { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.parts();
        let message = match &self {
            ApiError::NotFound(msg) | ApiError::BadRequest(msg) | ApiError::Conflict(msg) | ApiError::Internal(msg) => {
                msg.clone()
            }
            ApiError::Scan(err) => err.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_scan_errors_map_to_status() {
        let cases = [
            (ApiError::from(ScanError::UnknownScan(Uuid::nil())), StatusCode::NOT_FOUND),
            (
                ApiError::from(ScanError::InvalidInput("empty".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(ScanError::LearnerBusy("frozen".into())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(ScanError::HorizonNotElapsed {
                    identifier: "ACME".into(),
                    remaining_secs: 5,
                }),
                StatusCode::CONFLICT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
