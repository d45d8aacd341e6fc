//! HTTP route handlers.
//!
//! The REST façade for CRUD lives elsewhere; this router only exposes the
//! socket endpoint plus liveness and status probes.

use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::api::ws::ws_handler;
use crate::api::AppState;

const SERVICE_ID: &str = "pulseguard";

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route("/health", get(health_check))
        .route("/api/status", get(status))
        .route("/api/episodes/active", get(active_episodes))
        .route("/api/alerts/active", get(active_alerts))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect();
    if parsed.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
    }
}

/// Liveness probe: is the process running and how many devices are live.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "active_devices": state.plane.device_count(),
    }))
}

/// Connection-plane status snapshot for operators.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.plane.status())
}

/// Currently active episodes.
async fn active_episodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"episodes": state.episodes.active_episodes()}))
}

/// Currently active alerts.
async fn active_alerts(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"alerts": state.alerts.active_alerts()}))
}
