//! Liveness endpoint. Exempt from throttling.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Reports `ok` when PostgreSQL answers, `degraded` with a 503 otherwise.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (code, status) = match planner_common::db::ping(&state.pool).await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not reach the database");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
    };
    (
        code,
        Json(json!({
            "status": status,
            "service": "project-planner-api",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
