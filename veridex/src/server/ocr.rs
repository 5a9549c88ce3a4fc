//! OCR routes: process, job lookup, review submission, review polling.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{correlation_id, tenant_id, user_id, AppState};
use crate::errors::{ServiceError, ServiceResult};
use crate::ocr::OcrRequest;

pub async fn process_document(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut body): Json<OcrRequest>,
) -> ServiceResult<Json<Value>> {
    if body.tenant_id.is_empty() {
        body.tenant_id = tenant_id(&headers);
    }
    if body.user_id.is_none() {
        body.user_id = Some(user_id(&headers));
    }
    if body.correlation_id.is_none() {
        body.correlation_id = Some(correlation_id(&headers));
    }
    let outcome = state.ocr.process(&body).await?;
    Ok(Json(json!({
        "job": outcome.job,
        "cached": outcome.cached,
    })))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ServiceResult<Json<Value>> {
    let job = state
        .ocr
        .store()
        .get_job(&job_id)?
        .ok_or_else(|| ServiceError::NotFound(format!("OCR job {} not found", job_id)))?;
    Ok(Json(serde_json::to_value(job)?))
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    #[serde(default)]
    pub corrected_text: Option<String>,
    #[serde(default)]
    pub corrected_fields: Option<Value>,
    #[serde(default)]
    pub review_notes: Option<String>,
}

pub async fn submit_review(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> ServiceResult<Json<Value>> {
    let review = state
        .ocr
        .submit_review(
            &job_id,
            &user_id(&headers),
            body.corrected_text,
            body.corrected_fields,
            body.review_notes,
        )
        .await?;
    Ok(Json(serde_json::to_value(review)?))
}

pub async fn poll_review_queue(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "job_id": state.ocr.poll_review_queue().await }))
}
