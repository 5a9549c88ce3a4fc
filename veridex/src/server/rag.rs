//! Knowledge base routes: query, retrieve, ingest, similar documents.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{tenant_id, user_id, AppState};
use crate::errors::ServiceResult;
use crate::rag::{NewDocument, RagQueryRequest, RetrievalContext};

fn context(headers: &HeaderMap, request: &RagQueryRequest) -> RetrievalContext {
    RetrievalContext {
        tenant_id: tenant_id(headers),
        user_id: user_id(headers),
        suite_id: request.suite_id.clone(),
        module_id: request.module_id.clone(),
    }
}

pub async fn query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RagQueryRequest>,
) -> ServiceResult<Json<Value>> {
    let context = context(&headers, &body);
    let response = state.rag.query(&body, &context)?;
    Ok(Json(serde_json::to_value(response)?))
}

pub async fn retrieve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RagQueryRequest>,
) -> ServiceResult<Json<Value>> {
    let context = context(&headers, &body);
    let chunks = state.rag.retrieve(&body, &context)?;
    let count = chunks.len();
    Ok(Json(json!({ "chunks": chunks, "count": count })))
}

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub document: NewDocument,
    pub text: String,
}

pub async fn ingest_document(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> ServiceResult<Json<Value>> {
    let (document_id, chunks) = state.rag.ingest(&body.document, &body.text)?;
    Ok(Json(json!({
        "document_id": document_id,
        "chunks": chunks,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SimilarParams {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

fn default_top_k() -> usize {
    5
}

fn default_min_similarity() -> f64 {
    0.7
}

pub async fn similar_documents(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
    Query(params): Query<SimilarParams>,
) -> ServiceResult<Json<Value>> {
    let similar = state
        .rag
        .similar_documents(&document_id, params.top_k, params.min_similarity)?;
    Ok(Json(json!({ "documents": similar })))
}
