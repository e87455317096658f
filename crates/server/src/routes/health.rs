//! Health probes.

use crate::server::ServerState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// `GET /health`: service identity.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "neverdown",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /health/live`: process is up.
pub async fn live() -> Json<Value> {
    Json(json!({"status": "alive"}))
}

/// `GET /health/ready`: dependencies reachable.
pub async fn ready(State(state): State<Arc<ServerState>>) -> (StatusCode, Json<Value>) {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "ready"}))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": e.to_string()})),
        ),
    }
}
