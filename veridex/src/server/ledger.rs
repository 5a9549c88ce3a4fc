//! Ledger routes: append, query, export, verify.
//!
//! Ledger request-shape violations surface as 422 per this service's
//! contract, unlike the 400 used elsewhere.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::errors::ServiceError;
use crate::ledger::{AppendRequest, EventQuery};

fn ledger_error(e: ServiceError) -> Response {
    let status = match &e {
        ServiceError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    };
    (status, Json(json!({"detail": e.to_string()}))).into_response()
}

pub async fn append_event(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AppendRequest>,
) -> Response {
    match state.ledger.append(body).await {
        Ok(receipt) => Json(json!({
            "id": receipt.id,
            "chain_hash": receipt.chain_hash,
            "created_at": receipt.created_at,
        }))
        .into_response(),
        Err(e) => ledger_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub tenant_id: String,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn query_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventsParams>,
) -> Response {
    let query = EventQuery {
        tenant_id: params.tenant_id,
        event_type: params.event_type,
        correlation_id: params.correlation_id,
        limit: params.limit,
        offset: params.offset,
    };
    match state.ledger.query(&query) {
        Ok(page) => Json(serde_json::to_value(page).unwrap_or(Value::Null)).into_response(),
        Err(e) => ledger_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub tenant_id: String,
    #[serde(default)]
    pub event_type: Option<String>,
}

pub async fn export_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> Response {
    match state
        .ledger
        .export_csv(&params.tenant_id, params.event_type.as_deref())
    {
        Ok(csv) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            csv,
        )
            .into_response(),
        Err(e) => ledger_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    pub tenant_id: String,
}

pub async fn verify_chain(
    State(state): State<Arc<AppState>>,
    Query(params): Query<VerifyParams>,
) -> Response {
    match state.ledger.verify_chain(&params.tenant_id) {
        Ok(report) => Json(serde_json::to_value(report).unwrap_or(Value::Null)).into_response(),
        Err(e) => ledger_error(e),
    }
}
