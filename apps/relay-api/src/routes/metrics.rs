//! Backend call metrics: Prometheus text exposition plus a JSON summary.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(prometheus))
        .route("/metrics/summary", get(summary))
}

async fn prometheus(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.backend.stats().render_prometheus();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn summary(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.backend.stats();
    Json(serde_json::json!({
        "backend": stats.summary_json(),
        "breaker_open": state.backend.breaker_open(),
        "sessions": state.registry.session_count(),
    }))
}
