//! Approval tasks and their storage trait.
//!
//! A task transitions out of `pending` exactly once. Approve and reject are
//! compare-and-set operations: any caller losing the race observes the
//! post-state instead of an error.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Approved,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskStatus::Pending,
            "approved" => TaskStatus::Approved,
            "rejected" => TaskStatus::Rejected,
            _ => return None,
        })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTask {
    pub task_id: String,
    pub workflow_id: String,
    pub requester: String,
    pub created_at: DateTime<Utc>,
    /// Hash of the redacted payload bound to this task.
    pub payload_hash: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_data: Option<Value>,
}

/// Result of the approve CAS.
#[derive(Debug, Clone)]
pub enum ApproveOutcome {
    /// This caller won the transition; resume execution.
    Approved(ApprovalTask),
    /// The task had already left `pending`; no execution is attempted.
    AlreadyApproved(ApprovalTask),
    /// The task was rejected earlier.
    Rejected(ApprovalTask),
}

/// Result of the reject CAS.
#[derive(Debug, Clone)]
pub enum RejectOutcome {
    Rejected(ApprovalTask),
    AlreadyResolved(ApprovalTask),
}

/// Durable task storage. Implementations must make `approve`/`reject`
/// atomic with respect to concurrent callers.
#[async_trait::async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn insert(&self, task: ApprovalTask) -> ServiceResult<()>;

    async fn get(&self, task_id: &str) -> ServiceResult<Option<ApprovalTask>>;

    async fn find_by_workflow(&self, workflow_id: &str) -> ServiceResult<Option<ApprovalTask>>;

    async fn approve(
        &self,
        task_id: &str,
        approved_by: &str,
        approval_data: Value,
    ) -> ServiceResult<ApproveOutcome>;

    async fn reject(&self, task_id: &str, rejected_by: &str) -> ServiceResult<RejectOutcome>;

    async fn list_pending(&self) -> ServiceResult<Vec<ApprovalTask>>;
}

/// In-memory store for tests and single-process deployments.
pub struct MemoryApprovalStore {
    tasks: DashMap<String, ApprovalTask>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        MemoryApprovalStore {
            tasks: DashMap::new(),
        }
    }
}

impl Default for MemoryApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn insert(&self, task: ApprovalTask) -> ServiceResult<()> {
        if self.tasks.contains_key(&task.task_id) {
            return Err(ServiceError::Conflict(format!(
                "approval task {} already exists",
                task.task_id
            )));
        }
        self.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> ServiceResult<Option<ApprovalTask>> {
        Ok(self.tasks.get(task_id).map(|t| t.clone()))
    }

    async fn find_by_workflow(&self, workflow_id: &str) -> ServiceResult<Option<ApprovalTask>> {
        Ok(self
            .tasks
            .iter()
            .find(|t| t.workflow_id == workflow_id)
            .map(|t| t.clone()))
    }

    async fn approve(
        &self,
        task_id: &str,
        approved_by: &str,
        approval_data: Value,
    ) -> ServiceResult<ApproveOutcome> {
        // The dashmap entry guard serializes the status transition.
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            return Err(ServiceError::NotFound("Approval task not found".into()));
        };
        match entry.status {
            TaskStatus::Pending => {
                entry.status = TaskStatus::Approved;
                entry.approved_by = Some(approved_by.to_string());
                entry.approved_at = Some(Utc::now());
                entry.approval_data = Some(approval_data);
                Ok(ApproveOutcome::Approved(entry.clone()))
            }
            TaskStatus::Approved => Ok(ApproveOutcome::AlreadyApproved(entry.clone())),
            TaskStatus::Rejected => Ok(ApproveOutcome::Rejected(entry.clone())),
        }
    }

    async fn reject(&self, task_id: &str, rejected_by: &str) -> ServiceResult<RejectOutcome> {
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            return Err(ServiceError::NotFound("Approval task not found".into()));
        };
        if entry.status.is_pending() {
            entry.status = TaskStatus::Rejected;
            entry.approved_by = Some(rejected_by.to_string());
            entry.approved_at = Some(Utc::now());
            Ok(RejectOutcome::Rejected(entry.clone()))
        } else {
            Ok(RejectOutcome::AlreadyResolved(entry.clone()))
        }
    }

    async fn list_pending(&self) -> ServiceResult<Vec<ApprovalTask>> {
        Ok(self
            .tasks
            .iter()
            .filter(|t| t.status.is_pending())
            .map(|t| t.clone())
            .collect())
    }
}
