//! Validation, explanation, decision, and feedback routes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{correlation_id, tenant_id, user_id, AppState};
use crate::errors::{ServiceError, ServiceResult};
use crate::ledger::AppendRequest;
use crate::rulepack::{
    ExplanationRequest, InputType, ValidationFailure, ValidationOptions, ValidationRequest,
};

const VALID_DECISIONS: [&str; 4] = ["accept", "defer", "ignore", "override"];
const VALID_FEEDBACK: [&str; 4] = ["helpful", "not_helpful", "partially_helpful", "irrelevant"];

#[derive(Debug, Deserialize)]
pub struct ValidateBody {
    pub domain: String,
    #[serde(default)]
    pub input_type: Option<InputType>,
    #[serde(default)]
    pub input_data: Option<Value>,
    #[serde(default)]
    pub input_ref: Option<String>,
    #[serde(default)]
    pub options: Option<ValidationOptions>,
}

pub async fn submit_validation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ValidateBody>,
) -> ServiceResult<Json<Value>> {
    if body.input_data.is_none() && body.input_ref.is_none() {
        return Err(ServiceError::InvalidInput(
            "either input_data or input_ref is required".to_string(),
        ));
    }
    let corr = correlation_id(&headers);
    let mut options = body.options.unwrap_or_default();
    if options.tenant_id.is_none() {
        options.tenant_id = Some(tenant_id(&headers));
    }
    let request = ValidationRequest {
        request_id: uuid::Uuid::new_v4().to_string(),
        domain: body.domain,
        input_type: body.input_type.unwrap_or(InputType::Records),
        input_data: body.input_data,
        input_ref: body.input_ref,
        options,
        submitted_at: Utc::now(),
    };

    let response = state.router.route_validation(&request).await?;

    let mut envelope = serde_json::to_value(&response)?;
    if let Some(map) = envelope.as_object_mut() {
        map.insert("correlation_id".into(), Value::String(corr));
    }
    Ok(Json(envelope))
}

#[derive(Debug, Deserialize)]
pub struct ExplainBody {
    pub domain: String,
    #[serde(default)]
    pub failure_id: Option<String>,
    pub failure: ValidationFailure,
}

pub async fn explain_failure(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ExplainBody>,
) -> ServiceResult<Json<Value>> {
    let corr = correlation_id(&headers);
    let request = ExplanationRequest {
        domain: body.domain.clone(),
        failure: body.failure,
    };
    let explanation = state
        .router
        .route_explanation(&body.domain, &request)
        .await
        .map_err(|e| match e {
            ServiceError::NotFound(_) => e,
            other => ServiceError::Internal(format!("Explanation failed: {}", other)),
        })?;

    let mut envelope = serde_json::to_value(&explanation)?;
    if let Some(map) = envelope.as_object_mut() {
        map.insert("correlation_id".into(), Value::String(corr));
        if let Some(failure_id) = body.failure_id {
            map.insert("failure_id".into(), Value::String(failure_id));
        }
    }
    Ok(Json(envelope))
}

/// A reviewer's disposition of one validation failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureDecision {
    pub failure_id: String,
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub decided_by: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct DecisionParams {
    pub decision: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn update_decision(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(failure_id): Path<String>,
    Query(params): Query<DecisionParams>,
) -> ServiceResult<Json<FailureDecision>> {
    if !VALID_DECISIONS.contains(&params.decision.as_str()) {
        return Err(ServiceError::InvalidInput(format!(
            "Invalid decision '{}'; expected one of {}",
            params.decision,
            VALID_DECISIONS.join(", ")
        )));
    }
    let corr = correlation_id(&headers);
    let decision = FailureDecision {
        failure_id: failure_id.clone(),
        decision: params.decision,
        reason: params.reason,
        notes: params.notes,
        decided_by: user_id(&headers),
        updated_at: Utc::now(),
    };
    state.decisions.insert(failure_id.clone(), decision.clone());

    let event = AppendRequest::new(
        tenant_id(&headers),
        "validation.decision",
        json!({
            "failure_id": failure_id,
            "decision": decision.decision,
            "reason": decision.reason,
        }),
    )
    .with_user(decision.decided_by.clone())
    .with_correlation(corr);
    if let Err(e) = state.ledger.append(event).await {
        log::warn!("audit append for decision on {} failed: {}", failure_id, e);
    }

    Ok(Json(decision))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackParams {
    pub feedback: String,
    #[serde(default)]
    pub details: Option<String>,
}

pub async fn rag_feedback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(interaction_id): Path<String>,
    Query(params): Query<FeedbackParams>,
) -> ServiceResult<Json<Value>> {
    if !VALID_FEEDBACK.contains(&params.feedback.as_str()) {
        return Err(ServiceError::InvalidInput(format!(
            "Invalid feedback '{}'; expected one of {}",
            params.feedback,
            VALID_FEEDBACK.join(", ")
        )));
    }
    let event = AppendRequest::new(
        tenant_id(&headers),
        "rag.feedback",
        json!({
            "interaction_id": interaction_id,
            "feedback": params.feedback,
            "details": params.details,
        }),
    )
    .with_user(user_id(&headers))
    .with_correlation(correlation_id(&headers));
    if let Err(e) = state.ledger.append(event).await {
        log::warn!(
            "audit append for feedback on {} failed: {}",
            interaction_id,
            e
        );
    }

    Ok(Json(json!({
        "interaction_id": interaction_id,
        "feedback": params.feedback,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_vocabulary() {
        for d in VALID_DECISIONS {
            assert!(VALID_DECISIONS.contains(&d));
        }
        assert!(!VALID_DECISIONS.contains(&"approve"));
        assert!(!VALID_FEEDBACK.contains(&"amazing"));
        assert!(VALID_FEEDBACK.contains(&"partially_helpful"));
    }
}
