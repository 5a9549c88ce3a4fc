//! The uniform rule pack worker contract.
//!
//! Workers are domain-scoped validation engines addressed by `domain` and
//! registered against the registry. Every worker exposes the same capability
//! set: validate, explain, get_info, get_metadata, health_check, initialize,
//! shutdown. The router is the only component that reasons about modes;
//! workers only ever see their own mode directive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::ServiceResult;

pub mod client;

pub use client::HttpRulePackClient;

/// Caller-requested validation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Static,
    Hybrid,
    Agentic,
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidationMode::Static => "static",
            ValidationMode::Hybrid => "hybrid",
            ValidationMode::Agentic => "agentic",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fatal,
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Records,
    File,
    Blob,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOptions {
    pub mode: ValidationMode,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub max_failures: Option<usize>,
}

fn default_confidence_threshold() -> f64 {
    0.8
}

impl Default for ValidationOptions {
    fn default() -> Self {
        ValidationOptions {
            mode: ValidationMode::Static,
            confidence_threshold: default_confidence_threshold(),
            tenant_id: None,
            max_failures: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub request_id: String,
    pub domain: String,
    pub input_type: InputType,
    /// Inline input; opaque JSON, never deserialized at this layer.
    #[serde(default)]
    pub input_data: Option<Value>,
    /// Reference to previously uploaded input.
    #[serde(default)]
    pub input_ref: Option<String>,
    #[serde(default)]
    pub options: ValidationOptions,
    pub submitted_at: DateTime<Utc>,
}

impl ValidationRequest {
    pub fn new(domain: impl Into<String>, input_data: Value, mode: ValidationMode) -> Self {
        ValidationRequest {
            request_id: Uuid::new_v4().to_string(),
            domain: domain.into(),
            input_type: InputType::Records,
            input_data: Some(input_data),
            input_ref: None,
            options: ValidationOptions {
                mode,
                ..Default::default()
            },
            submitted_at: Utc::now(),
        }
    }

    /// Copy with the worker-facing mode directive replaced.
    pub fn with_mode(&self, mode: ValidationMode) -> Self {
        let mut request = self.clone();
        request.options.mode = mode;
        request
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub failure_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    /// AI-sourced fields below are populated by the router only; workers may
    /// leave them empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_confidence: Option<f64>,
    #[serde(default)]
    pub policy_references: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

impl ValidationFailure {
    pub fn new(rule_id: impl Into<String>, severity: Severity, description: impl Into<String>) -> Self {
        let rule_id = rule_id.into();
        ValidationFailure {
            failure_id: Uuid::new_v4().to_string(),
            rule_name: rule_id.clone(),
            rule_id,
            severity,
            line_number: None,
            field: None,
            description: description.into(),
            expected: None,
            actual: None,
            ai_explanation: None,
            ai_recommendation: None,
            ai_confidence: None,
            policy_references: Vec::new(),
            suggested_actions: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.ai_confidence = Some(confidence);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeverityCounts {
    pub fatal: usize,
    pub error: usize,
    pub warning: usize,
    pub info: usize,
}

impl SeverityCounts {
    pub fn tally(failures: &[ValidationFailure]) -> Self {
        let mut counts = SeverityCounts::default();
        for failure in failures {
            match failure.severity {
                Severity::Fatal => counts.fatal += 1,
                Severity::Error => counts.error += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Info => counts.info += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStats {
    pub total_records: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub counts_by_severity: SeverityCounts,
    pub processing_time_ms: u64,
    pub mode_used: ValidationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_ai_confidence: Option<f64>,
}

/// Set comparison between the JSON and RAG legs of a hybrid run, keyed on
/// `rule_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonDelta {
    pub json_only: Vec<String>,
    pub rag_only: Vec<String>,
    pub common: Vec<String>,
    pub agreement_rate: f64,
    pub avg_rag_confidence: f64,
    pub json_failure_count: usize,
    pub rag_failure_count: usize,
    pub analysis_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub request_id: String,
    pub domain: String,
    pub success: bool,
    pub summary: ValidationStats,
    pub failures: Vec<ValidationFailure>,
    pub mode_requested: ValidationMode,
    pub mode_executed: ValidationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_delta: Option<ComparisonDelta>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplanationRequest {
    pub domain: String,
    pub failure: ValidationFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplanationResponse {
    pub explanation: String,
    pub recommendation: String,
    pub confidence: f64,
    #[serde(default)]
    pub policy_references: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePackInfo {
    pub domain: String,
    pub name: String,
    pub version: String,
    pub supported_modes: Vec<ValidationMode>,
    pub rule_count: usize,
    #[serde(default)]
    pub categories: Vec<String>,
}

/// The worker capability set.
#[async_trait::async_trait]
pub trait RulePack: Send + Sync {
    async fn initialize(&self) -> ServiceResult<()>;
    async fn validate(&self, request: &ValidationRequest) -> ServiceResult<ValidationResponse>;
    async fn explain(&self, request: &ExplanationRequest) -> ServiceResult<ExplanationResponse>;
    async fn get_info(&self) -> ServiceResult<RulePackInfo>;
    async fn get_metadata(&self) -> ServiceResult<Value>;
    async fn health_check(&self) -> ServiceResult<Value>;
    async fn shutdown(&self) -> ServiceResult<()>;
}

/// Failures produced by a worker's retrieval-grounded validation path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagValidationData {
    /// Must be keyed by `rule_id` with `ai_confidence` populated.
    pub failures: Vec<ValidationFailure>,
    #[serde(default)]
    pub processing_time_ms: u64,
}

/// Retrieval-grounded validation leg used by the hybrid and agentic modes.
#[async_trait::async_trait]
pub trait RagValidator: Send + Sync {
    async fn validate_rag(&self, request: &ValidationRequest) -> ServiceResult<RagValidationData>;
}

/// What the router's client pool holds: a worker channel speaking both the
/// capability contract and the retrieval-grounded validation leg.
pub trait RulePackChannel: RulePack + RagValidator {}

impl<T: RulePack + RagValidator> RulePackChannel for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_serde_lowercase() {
        assert_eq!(
            serde_json::to_string(&ValidationMode::Agentic).unwrap(),
            "\"agentic\""
        );
        let mode: ValidationMode = serde_json::from_str("\"static\"").unwrap();
        assert_eq!(mode, ValidationMode::Static);
    }

    #[test]
    fn test_severity_tally() {
        let failures = vec![
            ValidationFailure::new("R1", Severity::Fatal, "a"),
            ValidationFailure::new("R2", Severity::Error, "b"),
            ValidationFailure::new("R3", Severity::Error, "c"),
            ValidationFailure::new("R4", Severity::Info, "d"),
        ];
        let counts = SeverityCounts::tally(&failures);
        assert_eq!(counts.fatal, 1);
        assert_eq!(counts.error, 2);
        assert_eq!(counts.warning, 0);
        assert_eq!(counts.info, 1);
    }

    #[test]
    fn test_with_mode_preserves_request_id() {
        let request =
            ValidationRequest::new("gtas", serde_json::json!({"a": 1}), ValidationMode::Hybrid);
        let static_copy = request.with_mode(ValidationMode::Static);
        assert_eq!(static_copy.request_id, request.request_id);
        assert_eq!(static_copy.options.mode, ValidationMode::Static);
        assert_eq!(request.options.mode, ValidationMode::Hybrid);
    }
}
