//! Liveness, readiness, and router health aggregation.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

pub async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn readyz() -> Json<Value> {
    Json(json!({"status": "ready"}))
}

pub async fn livez() -> Json<Value> {
    Json(json!({"status": "alive"}))
}

pub async fn router_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let health = state.router.health_check().await;
    Json(serde_json::to_value(health).unwrap_or_else(|_| json!({"router_status": "unhealthy"})))
}
