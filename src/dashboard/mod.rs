use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::db::models::PropPrediction;
use crate::db::{Database, Stats};
use crate::tracking::{performance_report, PerformanceReport};

const DEFAULT_BETS_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    /// Stake used to score settled bets in `/api/performance`
    pub stake: f64,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Build the Axum router for the results API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/bets", get(bets_handler))
        .route("/api/performance", get(performance_handler))
        .route("/api/stats", get(stats_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
pub struct BetsQuery {
    limit: Option<i64>,
}

/// GET /api/bets?limit=1000
async fn bets_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<BetsQuery>,
) -> ApiResult<Vec<PropPrediction>> {
    let limit = q.limit.unwrap_or(DEFAULT_BETS_LIMIT).max(0);
    state
        .db
        .list_latest_predictions(limit)
        .map(Json)
        .map_err(internal)
}

/// GET /api/performance
async fn performance_handler(State(state): State<Arc<AppState>>) -> ApiResult<PerformanceReport> {
    state
        .db
        .list_tracked_outcomes()
        .map(|outcomes| Json(performance_report(&outcomes, state.stake)))
        .map_err(internal)
}

/// GET /api/stats
async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult<Stats> {
    state.db.get_stats().map(Json).map_err(internal)
}
