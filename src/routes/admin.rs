//! Cache administration endpoints.

use axum::{
    extract::State,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use tracing::info;

use super::{AddressRequest, ApiError, AppState};
use crate::cache::CacheStats;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/admin/cache", get(stats).delete(clear))
        .route("/v1/cache", delete(invalidate))
}

async fn stats(State(engine): State<AppState>) -> Result<Json<CacheStats>, ApiError> {
    Ok(Json(engine.cache_stats()?))
}

#[derive(Debug, Serialize)]
struct Cleared {
    removed: usize,
}

async fn clear(State(engine): State<AppState>) -> Result<Json<Cleared>, ApiError> {
    // ---
    let removed = engine.clear_cache()?;
    info!("DELETE /admin/cache - removed {} entries", removed);
    Ok(Json(Cleared { removed }))
}

#[derive(Debug, Serialize)]
struct Invalidated {
    message: &'static str,
    address: String,
}

async fn invalidate(
    State(engine): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<Invalidated>, ApiError> {
    // ---
    let key = engine.resolve(&req.house_number, &req.street, &req.borough)?;
    if !engine.invalidate(&req.house_number, &req.street, &req.borough)? {
        return Err(ApiError::not_found("No cache entry found for this address"));
    }
    Ok(Json(Invalidated {
        message: "Cache entry deleted",
        address: key.formatted(),
    }))
}
