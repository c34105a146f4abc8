//! Routes gateway: merges every subrouter and binds the shared engine state.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::engine::DistressEngine;
use crate::error::EngineError;

mod admin;
mod analyze;
mod health;

// ---

pub type AppState = Arc<DistressEngine>;

pub fn router(engine: AppState) -> Router {
    // ---
    Router::new()
        .merge(analyze::router())
        .merge(admin::router())
        .merge(health::router())
        .with_state(engine)
}

/// Address payload accepted by every property endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressRequest {
    // ---
    pub house_number: String,
    pub street: String,
    pub borough: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
    code: u16,
}

/// Handler error rendered as `{error, detail, code}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    detail: String,
}

impl ApiError {
    // ---
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: "not_found",
            detail: detail.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        // ---
        let (status, error) = match &e {
            EngineError::InvalidAddress(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_address"),
            EngineError::AllSourcesFailed(_) => (StatusCode::SERVICE_UNAVAILABLE, "all_sources_failed"),
            EngineError::CacheUnavailable(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        Self {
            status,
            error,
            detail: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), "{}", self.detail);
        }
        let body = ErrorBody {
            error: self.error,
            detail: self.detail,
            code: self.status.as_u16(),
        };
        (self.status, Json(body)).into_response()
    }
}
