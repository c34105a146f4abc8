//! Property analysis endpoints: full report, agent one-liner and timeline.

use axum::{
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use super::{AddressRequest, ApiError, AppState};
use crate::models::PropertyReport;
use crate::timeline::{MonthSummary, TimelineEvent};

// ---

const MAX_TIMELINE_EVENTS: usize = 500;

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/v1/analyze", post(analyze))
        .route("/v1/agent", post(agent))
        .route("/v1/timeline", post(timeline))
}

async fn analyze(
    State(engine): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<PropertyReport>, ApiError> {
    // ---
    let span = info_span!("analyze", request_id = %Uuid::new_v4());
    async move {
        info!("POST /v1/analyze - {} {}, {}", req.house_number, req.street, req.borough);
        let report = engine.analyze(&req.house_number, &req.street, &req.borough).await?;
        Ok(Json(report))
    }
    .instrument(span)
    .await
}

#[derive(Debug, Serialize)]
struct AgentResponse {
    response: String,
}

async fn agent(
    State(engine): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<AgentResponse>, ApiError> {
    // ---
    let span = info_span!("agent", request_id = %Uuid::new_v4());
    async move {
        info!("POST /v1/agent - {} {}, {}", req.house_number, req.street, req.borough);
        let report = engine.analyze(&req.house_number, &req.street, &req.borough).await?;
        Ok(Json(AgentResponse {
            response: report.agent_summary(),
        }))
    }
    .instrument(span)
    .await
}

#[derive(Debug, Deserialize)]
struct TimelineParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TimelineResponse {
    address: String,
    bbl: Option<String>,
    events: Vec<TimelineEvent>,
    monthly_summary: Vec<MonthlyEntry>,
    total_events: usize,
    earliest_date: Option<chrono::NaiveDate>,
    latest_date: Option<chrono::NaiveDate>,
    partial_data: bool,
}

#[derive(Debug, Serialize)]
struct MonthlyEntry {
    period: String,
    #[serde(flatten)]
    counts: MonthSummary,
}

async fn timeline(
    State(engine): State<AppState>,
    Query(params): Query<TimelineParams>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<TimelineResponse>, ApiError> {
    // ---
    let span = info_span!("timeline", request_id = %Uuid::new_v4());
    async move {
        info!("POST /v1/timeline - {} {}, {}", req.house_number, req.street, req.borough);
        let limit = params.limit.unwrap_or(MAX_TIMELINE_EVENTS).clamp(1, MAX_TIMELINE_EVENTS);
        let (report, timeline) = engine.timeline(&req.house_number, &req.street, &req.borough).await?;

        let total_events = timeline.len();
        let mut events = timeline.events;
        events.truncate(limit);
        let truncated = total_events > events.len();

        // Newest month first.
        let monthly_summary = timeline
            .monthly
            .into_iter()
            .rev()
            .map(|(period, counts)| MonthlyEntry { period, counts })
            .collect();

        Ok(Json(TimelineResponse {
            address: report.address,
            bbl: report.bbl,
            events,
            monthly_summary,
            total_events,
            earliest_date: timeline.earliest,
            latest_date: timeline.latest,
            partial_data: report.partial_data || truncated,
        }))
    }
    .instrument(span)
    .await
}
