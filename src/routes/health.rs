// src/routes/health.rs
//! API health check endpoint.
//!
//! Reports liveness plus the state of the two shared resources that shape
//! response quality: the DOB circuit breaker and the result cache. The
//! handler never calls an upstream source.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::cache::CacheStats;
use crate::sources::dob::BreakerStatus;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    dob_breaker: Option<BreakerStatus>,
    cache: Option<CacheStats>,
}

/// Handle `GET /health`.
///
/// `status` is `degraded` while the DOB breaker is not closed or the cache
/// is unusable; the service still answers requests in that state.
async fn health(State(engine): State<AppState>) -> Json<HealthResponse> {
    // ---
    let dob_breaker = engine.breaker_status();
    let cache = engine.cache_stats().ok();
    let degraded = cache.is_none() || dob_breaker.as_ref().is_some_and(|b| b.state != "closed");

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        dob_breaker,
        cache,
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
