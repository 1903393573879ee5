// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`:
//   GET /api/v1/health                          relay status and counters
//   GET /api/v1/candles/:symbol/:timeframe      closed candles, oldest first
//   GET /api/v1/ws                              WebSocket live feed
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::engine::StatsSnapshot;
use crate::market_data::Timeframe;
use crate::types::CandleRecord;

/// Upper bound on `?limit=` for the history endpoint.
const MAX_HISTORY_LIMIT: usize = 1_000;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/candles/:symbol/:timeframe", get(candles))
        // ── WebSocket (handled in the ws module but mounted here) ───
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    ws_connections: u64,
    ws_messages_sent: u64,
    subscribers: usize,
    active_symbols: Vec<String>,
    engine: StatsSnapshot,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        ws_connections: state.open_connections(),
        ws_messages_sent: state.ws_messages_sent.load(Ordering::Relaxed),
        subscribers: state.sink.subscriber_count(),
        active_symbols: state.engine.aggregator().symbols(),
        engine: state.engine.stats(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Historical candles
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize, Deserialize)]
struct CandleResponse {
    symbol: String,
    timeframe: Timeframe,
    candles: Vec<CandleRecord>,
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    (status, Json(serde_json::json!({ "error": msg }))).into_response()
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let Ok(timeframe) = timeframe.parse::<Timeframe>() else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid timeframe. Use: 30s, 1m, 5m, or 1h",
        );
    };

    let symbol = symbol.trim().to_uppercase();
    let limit = query
        .limit
        .unwrap_or(state.config.history_limit)
        .min(MAX_HISTORY_LIMIT);

    match state.store().recent(&symbol, timeframe, limit).await {
        Ok(mut candles) => {
            // Store returns newest first; charts want oldest first.
            candles.reverse();
            Json(CandleResponse {
                symbol,
                timeframe,
                candles,
            })
            .into_response()
        }
        Err(e) => {
            warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "candle history read failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch candles")
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
