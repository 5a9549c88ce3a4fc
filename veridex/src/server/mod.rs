//! Gateway HTTP surface.
//!
//! One axum router over a shared [`AppState`]; errors surface as
//! `{"detail": ...}` JSON with the kind's status code. Incoming
//! `X-Correlation-ID` and `traceparent` headers propagate to every
//! downstream call, and the correlation id is echoed in validation,
//! explanation, and workflow response envelopes.

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use dashmap::DashMap;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::ledger::LedgerService;
use crate::ocr::OcrPipeline;
use crate::rag::RagService;
use crate::registry::InMemoryRegistry;
use crate::router::PolicyRouter;
use crate::workflow::{DesignerCompiler, WorkflowExecutor};

pub mod health;
pub mod ledger;
pub mod ocr;
pub mod rag;
pub mod validation;
pub mod workflow;

// Re-exported so the gateway binary serves without depending on axum itself.
pub use axum;
pub use validation::FailureDecision;

pub struct AppState {
    pub router: Arc<PolicyRouter>,
    pub workflows: Arc<WorkflowExecutor>,
    pub designer: Arc<DesignerCompiler>,
    pub ledger: Arc<LedgerService>,
    pub rag: Arc<RagService>,
    pub ocr: Arc<OcrPipeline>,
    pub registry: Arc<InMemoryRegistry>,
    /// Reviewer decisions on validation failures, by failure id.
    pub decisions: DashMap<String, FailureDecision>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.status_code())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}

/// Incoming correlation id, or a fresh one.
pub(crate) fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub(crate) fn user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

pub(crate) fn tenant_id(headers: &HeaderMap) -> String {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("platform")
        .to_string()
}

/// The full route table.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // health
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/livez", get(health::livez))
        .route("/health/router", get(health::router_health))
        // validation
        .route("/jobs/validate", post(validation::submit_validation))
        .route("/explain", post(validation::explain_failure))
        .route("/failures/:failure_id/decision", put(validation::update_decision))
        .route("/feedback/rag/:interaction_id", post(validation::rag_feedback))
        // workflow
        .route("/execute-workflow", post(workflow::execute_workflow))
        .route("/workflow/approve/:task_id", post(workflow::approve_workflow))
        .route("/workflow/reject/:task_id", post(workflow::reject_workflow))
        .route("/workflow/status/:workflow_id", get(workflow::workflow_status))
        .route("/designer/compile", post(workflow::designer_compile))
        // ledger
        .route("/append", post(ledger::append_event))
        .route("/events", get(ledger::query_events))
        .route("/export", get(ledger::export_events))
        .route("/verify", get(ledger::verify_chain))
        // rag
        .route("/query", post(rag::query))
        .route("/retrieve", post(rag::retrieve))
        .route("/documents", post(rag::ingest_document))
        .route("/documents/:document_id/similar", get(rag::similar_documents))
        // ocr
        .route("/ocr/process", post(ocr::process_document))
        .route("/ocr/jobs/:job_id", get(ocr::get_job))
        .route("/ocr/jobs/:job_id/review", post(ocr::submit_review))
        .route("/ocr/review-queue", get(ocr::poll_review_queue))
        .with_state(state)
}
