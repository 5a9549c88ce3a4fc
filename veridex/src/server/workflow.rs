//! Workflow execution, approval, and designer compile routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::Value;

use super::{correlation_id, user_id, AppState};
use crate::errors::ServiceResult;
use crate::workflow::{DesignerCompileRequest, WorkflowExecutionRequest};

pub async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<WorkflowExecutionRequest>,
) -> ServiceResult<Json<Value>> {
    let response = state
        .workflows
        .submit(&body, &user_id(&headers), &correlation_id(&headers))
        .await?;
    Ok(Json(serde_json::to_value(response)?))
}

pub async fn approve_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(approval_data): Json<Value>,
) -> ServiceResult<Json<Value>> {
    let response = state
        .workflows
        .approve(
            &task_id,
            approval_data,
            &user_id(&headers),
            &correlation_id(&headers),
        )
        .await?;
    Ok(Json(serde_json::to_value(response)?))
}

pub async fn reject_workflow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ServiceResult<Json<Value>> {
    let response = state
        .workflows
        .reject(&task_id, &user_id(&headers), &correlation_id(&headers))
        .await?;
    Ok(Json(serde_json::to_value(response)?))
}

pub async fn workflow_status(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ServiceResult<Json<Value>> {
    let status = state.workflows.status(&workflow_id).await?;
    Ok(Json(serde_json::to_value(status)?))
}

pub async fn designer_compile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DesignerCompileRequest>,
) -> ServiceResult<axum::response::Response> {
    let response = state
        .designer
        .compile(&body, &user_id(&headers), &correlation_id(&headers))
        .await?;
    let status = if response.status == "failed" {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok((status, Json(serde_json::to_value(response)?)).into_response())
}
