//! Workflow execution with a human-in-the-loop approval gate.
//!
//! Every submitted workflow is classified first: anything touching legal or
//! financial data, or carrying a monetary amount above the configured
//! threshold, suspends behind an approval task and resumes deterministically
//! on approval. All state transitions are appended to the audit ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod approval;
pub mod designer;
pub mod executor;
pub mod hil;
pub mod store;

pub use approval::{ApprovalStore, ApprovalTask, ApproveOutcome, MemoryApprovalStore, TaskStatus};
pub use designer::{DesignerCompileRequest, DesignerCompileResponse, DesignerCompiler};
pub use executor::{WorkflowExecutor, WorkflowJob, WorkflowRunner};
pub use hil::HilPolicy;
pub use store::{SqliteApprovalStore, WorkflowRecordStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    PendingApproval,
    Executing,
    Executed,
    ApprovedAndExecuted,
    ApprovedButFailed,
    Failed,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::PendingApproval => "pending_approval",
            WorkflowState::Executing => "executing",
            WorkflowState::Executed => "executed",
            WorkflowState::ApprovedAndExecuted => "approved_and_executed",
            WorkflowState::ApprovedButFailed => "approved_but_failed",
            WorkflowState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending_approval" => WorkflowState::PendingApproval,
            "executing" => WorkflowState::Executing,
            "executed" => WorkflowState::Executed,
            "approved_and_executed" => WorkflowState::ApprovedAndExecuted,
            "approved_but_failed" => WorkflowState::ApprovedButFailed,
            "failed" => WorkflowState::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionRequest {
    /// Workflow pack ID from the packs registry.
    pub workflow_pack_id: String,
    /// Workflow type (e.g. legal, financial, operational).
    pub workflow_type: String,
    /// Workflow-specific payload; opaque JSON.
    pub payload: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Persisted execution record. `workflow_id` is assigned on submission and
/// never changes; `payload` is stored in redacted form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    pub workflow_id: String,
    pub workflow_pack_id: String,
    pub workflow_type: String,
    pub payload: Value,
    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResponse {
    /// executed | pending_approval | failed
    pub status: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_task_id: Option<String>,
    pub requires_human_approval: bool,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// executed variants: approved_and_executed | approved_but_failed;
    /// idempotent re-approval: already_approved; rejection: rejected.
    pub status: String,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusResponse {
    pub workflow_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_task_id: Option<String>,
    pub correlation_id: String,
}
