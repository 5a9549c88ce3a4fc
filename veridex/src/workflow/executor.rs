//! Workflow executor.
//!
//! Submission classifies the workflow, redacts the payload, and either runs
//! it immediately or suspends it behind an approval task. Approval resumes
//! execution on the approval caller's task, but always with the submission's
//! original correlation_id so the end-to-end trace stays continuous.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::approval::{ApprovalStore, ApprovalTask, ApproveOutcome, RejectOutcome, TaskStatus};
use super::hil::HilPolicy;
use super::store::WorkflowRecordStore;
use super::{
    ApprovalResponse, WorkflowExecutionRecord, WorkflowExecutionRequest,
    WorkflowExecutionResponse, WorkflowState, WorkflowStatusResponse,
};
use crate::canonical::hash_value;
use crate::errors::{ServiceError, ServiceResult};
use crate::http::GatewayClient;
use crate::ledger::{AppendRequest, AuditSink};
use crate::redaction::Redactor;

/// Job handed to the downstream orchestration runner. The payload is the
/// redacted form; workers never see raw PII.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub workflow_id: String,
    pub workflow_pack_id: String,
    pub workflow_type: String,
    pub payload: Value,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_task_id: Option<String>,
    pub correlation_id: String,
}

/// Downstream execution seam; the production implementation posts to the
/// platform workflow service.
#[async_trait::async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn execute(&self, job: &WorkflowJob) -> ServiceResult<Value>;
}

pub struct HttpWorkflowRunner {
    client: Arc<GatewayClient>,
}

impl HttpWorkflowRunner {
    pub fn new(client: Arc<GatewayClient>) -> Self {
        HttpWorkflowRunner { client }
    }
}

#[async_trait::async_trait]
impl WorkflowRunner for HttpWorkflowRunner {
    async fn execute(&self, job: &WorkflowJob) -> ServiceResult<Value> {
        let body = serde_json::to_value(job)?;
        self.client
            .post_json("/workflow/execute", &body, Some(&job.correlation_id), None)
            .await
    }
}

pub struct WorkflowExecutor {
    hil: HilPolicy,
    approvals: Arc<dyn ApprovalStore>,
    records: Arc<WorkflowRecordStore>,
    runner: Arc<dyn WorkflowRunner>,
    redactor: Redactor,
    audit: Arc<dyn AuditSink>,
}

impl WorkflowExecutor {
    pub fn new(
        hil: HilPolicy,
        approvals: Arc<dyn ApprovalStore>,
        records: Arc<WorkflowRecordStore>,
        runner: Arc<dyn WorkflowRunner>,
        redactor: Redactor,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        WorkflowExecutor {
            hil,
            approvals,
            records,
            runner,
            redactor,
            audit,
        }
    }

    fn audit_tenant(request_metadata: Option<&Value>) -> String {
        request_metadata
            .and_then(|m| m.get("tenant_id"))
            .and_then(Value::as_str)
            .unwrap_or("platform")
            .to_string()
    }

    /// Submit a workflow. Classification runs on the raw payload; everything
    /// persisted or forwarded carries the redacted form plus the unredacted
    /// input hash.
    pub async fn submit(
        &self,
        request: &WorkflowExecutionRequest,
        user_id: &str,
        correlation_id: &str,
    ) -> ServiceResult<WorkflowExecutionResponse> {
        let workflow_id = Uuid::new_v4().to_string();
        let input_hash = hash_value(&serde_json::to_value(request)?)?;
        let redacted_payload = self
            .redactor
            .redact_value(&request.payload, Some(correlation_id))
            .await;

        let needs_hil = self
            .hil
            .requires_approval(&request.workflow_type, &request.payload);

        let mut record = WorkflowExecutionRecord {
            workflow_id: workflow_id.clone(),
            workflow_pack_id: request.workflow_pack_id.clone(),
            workflow_type: request.workflow_type.clone(),
            payload: redacted_payload.clone(),
            state: WorkflowState::Executing,
            approval_task_id: None,
            approved_by: None,
            approved_at: None,
            created_at: Utc::now(),
            correlation_id: correlation_id.to_string(),
            metadata: request.metadata.clone(),
        };

        let response = if needs_hil {
            let task = ApprovalTask {
                task_id: Uuid::new_v4().to_string(),
                workflow_id: workflow_id.clone(),
                requester: user_id.to_string(),
                created_at: Utc::now(),
                payload_hash: hash_value(&redacted_payload)?,
                status: TaskStatus::Pending,
                approved_by: None,
                approved_at: None,
                approval_data: None,
            };
            let task_id = task.task_id.clone();
            self.approvals.insert(task).await?;

            record.state = WorkflowState::PendingApproval;
            record.approval_task_id = Some(task_id.clone());
            self.records.insert(&record)?;

            WorkflowExecutionResponse {
                status: "pending_approval".into(),
                workflow_id: workflow_id.clone(),
                approval_task_id: Some(task_id),
                requires_human_approval: true,
                correlation_id: correlation_id.to_string(),
                message: Some("Workflow requires human approval before execution".into()),
            }
        } else {
            self.records.insert(&record)?;
            let job = WorkflowJob {
                workflow_id: workflow_id.clone(),
                workflow_pack_id: request.workflow_pack_id.clone(),
                workflow_type: request.workflow_type.clone(),
                payload: redacted_payload,
                metadata: request.metadata.clone(),
                approval_task_id: None,
                correlation_id: correlation_id.to_string(),
            };
            match self.runner.execute(&job).await {
                Ok(_) => {
                    self.records.update_state(&workflow_id, WorkflowState::Executed)?;
                    WorkflowExecutionResponse {
                        status: "executed".into(),
                        workflow_id: workflow_id.clone(),
                        approval_task_id: None,
                        requires_human_approval: false,
                        correlation_id: correlation_id.to_string(),
                        message: Some("Workflow executed successfully".into()),
                    }
                }
                Err(e) => {
                    log::error!("workflow execution failed: {}", e);
                    self.records.update_state(&workflow_id, WorkflowState::Failed)?;
                    WorkflowExecutionResponse {
                        status: "failed".into(),
                        workflow_id: workflow_id.clone(),
                        approval_task_id: None,
                        requires_human_approval: false,
                        correlation_id: correlation_id.to_string(),
                        message: Some(format!("Workflow execution failed: {}", e)),
                    }
                }
            }
        };

        let output_hash = hash_value(&serde_json::to_value(&response)?)?;
        let event_type = match response.status.as_str() {
            "pending_approval" => "workflow.approval_required",
            "executed" => "workflow.started",
            _ => "workflow.failed",
        };
        let audit_event = AppendRequest::new(
            Self::audit_tenant(request.metadata.as_ref()),
            event_type,
            serde_json::json!({
                "workflow_id": workflow_id,
                "workflow_pack_id": request.workflow_pack_id,
                "input_hash": input_hash,
                "output_hash": output_hash,
                "requires_hil": needs_hil,
            }),
        )
        .with_user(user_id)
        .with_correlation(correlation_id);
        if let Err(e) = self.audit.record(audit_event).await {
            log::warn!("audit append for workflow {} failed: {}", workflow_id, e);
        }

        Ok(response)
    }

    /// Approve a pending task and resume the suspended workflow. Idempotent:
    /// a task leaves `pending` exactly once, and every later call observes
    /// `already_approved` without re-executing anything.
    pub async fn approve(
        &self,
        task_id: &str,
        approval_data: Value,
        user_id: &str,
        caller_correlation_id: &str,
    ) -> ServiceResult<ApprovalResponse> {
        let outcome = self
            .approvals
            .approve(task_id, user_id, approval_data.clone())
            .await?;

        let task = match outcome {
            ApproveOutcome::AlreadyApproved(task) => {
                return Ok(ApprovalResponse {
                    status: "already_approved".into(),
                    workflow_id: task.workflow_id,
                    execution_status: None,
                    error: None,
                    message: "Task was already approved".into(),
                    correlation_id: caller_correlation_id.to_string(),
                });
            }
            ApproveOutcome::Rejected(task) => {
                return Ok(ApprovalResponse {
                    status: "rejected".into(),
                    workflow_id: task.workflow_id,
                    execution_status: None,
                    error: None,
                    message: "Task was rejected and cannot be approved".into(),
                    correlation_id: caller_correlation_id.to_string(),
                });
            }
            ApproveOutcome::Approved(task) => task,
        };

        let record = self
            .records
            .get(&task.workflow_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("workflow {} not found", task.workflow_id)))?;

        let job = WorkflowJob {
            workflow_id: record.workflow_id.clone(),
            workflow_pack_id: record.workflow_pack_id.clone(),
            workflow_type: record.workflow_type.clone(),
            payload: record.payload.clone(),
            metadata: record.metadata.clone(),
            approval_task_id: Some(task_id.to_string()),
            // The submission's correlation_id, not the approval caller's.
            correlation_id: record.correlation_id.clone(),
        };

        let response = match self.runner.execute(&job).await {
            Ok(exec_response) => {
                self.records.mark_approved(
                    &record.workflow_id,
                    WorkflowState::ApprovedAndExecuted,
                    user_id,
                )?;
                ApprovalResponse {
                    status: "approved_and_executed".into(),
                    workflow_id: record.workflow_id.clone(),
                    execution_status: exec_response
                        .get("status")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .or_else(|| Some("executed".into())),
                    error: None,
                    message: "Workflow approved and executed".into(),
                    correlation_id: caller_correlation_id.to_string(),
                }
            }
            Err(e) => {
                log::error!("failed to execute approved workflow: {}", e);
                self.records.mark_approved(
                    &record.workflow_id,
                    WorkflowState::ApprovedButFailed,
                    user_id,
                )?;
                ApprovalResponse {
                    status: "approved_but_failed".into(),
                    workflow_id: record.workflow_id.clone(),
                    execution_status: None,
                    error: Some(e.to_string()),
                    message: "Workflow approved but execution failed".into(),
                    correlation_id: caller_correlation_id.to_string(),
                }
            }
        };

        let approval_hash = hash_value(&serde_json::json!({
            "approval_task_id": task_id,
            "approval_data": approval_data,
        }))?;
        let audit_event = AppendRequest::new(
            Self::audit_tenant(record.metadata.as_ref()),
            "workflow.approval_granted",
            serde_json::json!({
                "approval_task_id": task_id,
                "workflow_id": record.workflow_id,
                "approved_by": user_id,
                "input_hash": approval_hash,
                "execution_status": response.execution_status,
            }),
        )
        .with_user(user_id)
        .with_correlation(caller_correlation_id);
        if let Err(e) = self.audit.record(audit_event).await {
            log::warn!("audit append for approval {} failed: {}", task_id, e);
        }

        Ok(response)
    }

    /// Reject a pending task; the workflow terminates in `failed`.
    pub async fn reject(
        &self,
        task_id: &str,
        user_id: &str,
        caller_correlation_id: &str,
    ) -> ServiceResult<ApprovalResponse> {
        let outcome = self.approvals.reject(task_id, user_id).await?;
        let (status, task) = match outcome {
            RejectOutcome::Rejected(task) => {
                self.records
                    .update_state(&task.workflow_id, WorkflowState::Failed)?;
                ("rejected", task)
            }
            RejectOutcome::AlreadyResolved(task) => ("already_resolved", task),
        };

        if status == "rejected" {
            let audit_event = AppendRequest::new(
                "platform",
                "workflow.approval_rejected",
                serde_json::json!({
                    "approval_task_id": task_id,
                    "workflow_id": task.workflow_id,
                    "rejected_by": user_id,
                }),
            )
            .with_user(user_id)
            .with_correlation(caller_correlation_id);
            if let Err(e) = self.audit.record(audit_event).await {
                log::warn!("audit append for rejection {} failed: {}", task_id, e);
            }
        }

        Ok(ApprovalResponse {
            status: status.into(),
            workflow_id: task.workflow_id,
            execution_status: None,
            error: None,
            message: match status {
                "rejected" => "Workflow rejected".into(),
                _ => "Task was already resolved".into(),
            },
            correlation_id: caller_correlation_id.to_string(),
        })
    }

    /// Status lookup; falls back to the approval task store when no
    /// execution record is known for the id.
    pub async fn status(&self, workflow_id: &str) -> ServiceResult<WorkflowStatusResponse> {
        if let Some(record) = self.records.get(workflow_id)? {
            let approval_task_id = match record.state {
                WorkflowState::PendingApproval => record.approval_task_id,
                _ => None,
            };
            return Ok(WorkflowStatusResponse {
                workflow_id: record.workflow_id,
                status: record.state.as_str().to_string(),
                approval_task_id,
                correlation_id: record.correlation_id,
            });
        }

        if let Some(task) = self.approvals.find_by_workflow(workflow_id).await? {
            return Ok(WorkflowStatusResponse {
                workflow_id: workflow_id.to_string(),
                status: match task.status {
                    TaskStatus::Pending => "pending_approval".into(),
                    TaskStatus::Approved => "approved".into(),
                    TaskStatus::Rejected => "failed".into(),
                },
                approval_task_id: task.status.is_pending().then(|| task.task_id.clone()),
                correlation_id: String::new(),
            });
        }

        Err(ServiceError::NotFound("Workflow not found".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerService, LedgerStore};
    use crate::workflow::approval::MemoryApprovalStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingRunner {
        fn new(fail: bool) -> Self {
            CountingRunner {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait::async_trait]
    impl WorkflowRunner for CountingRunner {
        async fn execute(&self, job: &WorkflowJob) -> ServiceResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ServiceError::UpstreamUnavailable("orchestrator down".into()));
            }
            Ok(json!({"status": "executed", "workflow_id": job.workflow_id}))
        }
    }

    fn executor(runner: Arc<CountingRunner>) -> (WorkflowExecutor, Arc<LedgerService>) {
        let ledger = Arc::new(LedgerService::new(LedgerStore::open_in_memory().unwrap()));
        let executor = WorkflowExecutor::new(
            HilPolicy::default(),
            Arc::new(MemoryApprovalStore::new()),
            Arc::new(WorkflowRecordStore::open_in_memory().unwrap()),
            runner,
            Redactor::local(),
            ledger.clone(),
        );
        (executor, ledger)
    }

    fn legal_request() -> WorkflowExecutionRequest {
        WorkflowExecutionRequest {
            workflow_pack_id: "title.pack".into(),
            workflow_type: "legal".into(),
            payload: json!({"deed": "book 7 page 13"}),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_direct_execution_path() {
        let runner = Arc::new(CountingRunner::new(false));
        let (executor, ledger) = executor(runner.clone());
        let request = WorkflowExecutionRequest {
            workflow_pack_id: "ops.pack".into(),
            workflow_type: "operational".into(),
            payload: json!({"amount": 10_000}),
            metadata: None,
        };
        let response = executor.submit(&request, "user-1", "corr-1").await.unwrap();
        assert_eq!(response.status, "executed");
        assert!(!response.requires_human_approval);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let status = executor.status(&response.workflow_id).await.unwrap();
        assert_eq!(status.status, "executed");

        let page = ledger
            .query(&crate::ledger::EventQuery {
                tenant_id: "platform".into(),
                event_type: Some("workflow.started".into()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let runner = Arc::new(CountingRunner::new(false));
        let (executor, _) = executor(runner);
        let at_threshold = WorkflowExecutionRequest {
            workflow_pack_id: "ops.pack".into(),
            workflow_type: "operational".into(),
            payload: json!({"amount": 10_000}),
            metadata: None,
        };
        let response = executor.submit(&at_threshold, "u", "c").await.unwrap();
        assert_eq!(response.status, "executed");

        let above = WorkflowExecutionRequest {
            payload: json!({"amount": 10_001}),
            ..at_threshold
        };
        let response = executor.submit(&above, "u", "c").await.unwrap();
        assert_eq!(response.status, "pending_approval");
        assert!(response.approval_task_id.is_some());
    }

    #[tokio::test]
    async fn test_hil_suspend_approve_resume() {
        let runner = Arc::new(CountingRunner::new(false));
        let (executor, _) = executor(runner.clone());

        let response = executor
            .submit(&legal_request(), "user-1", "corr-original")
            .await
            .unwrap();
        assert_eq!(response.status, "pending_approval");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        let task_id = response.approval_task_id.unwrap();

        let approved = executor
            .approve(&task_id, json!({"note": "ok"}), "approver-1", "corr-approve")
            .await
            .unwrap();
        assert_eq!(approved.status, "approved_and_executed");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        // Idempotent: re-approval never re-executes.
        let again = executor
            .approve(&task_id, json!({}), "approver-2", "corr-again")
            .await
            .unwrap();
        assert_eq!(again.status, "already_approved");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let status = executor.status(&approved.workflow_id).await.unwrap();
        assert_eq!(status.status, "approved_and_executed");
        assert!(status.approval_task_id.is_none());
    }

    #[tokio::test]
    async fn test_resume_uses_original_correlation() {
        struct CapturingRunner(std::sync::Mutex<Option<String>>);

        #[async_trait::async_trait]
        impl WorkflowRunner for CapturingRunner {
            async fn execute(&self, job: &WorkflowJob) -> ServiceResult<Value> {
                *self.0.lock().unwrap() = Some(job.correlation_id.clone());
                Ok(json!({"status": "executed"}))
            }
        }

        let runner = Arc::new(CapturingRunner(std::sync::Mutex::new(None)));
        let ledger = Arc::new(LedgerService::new(LedgerStore::open_in_memory().unwrap()));
        let executor = WorkflowExecutor::new(
            HilPolicy::default(),
            Arc::new(MemoryApprovalStore::new()),
            Arc::new(WorkflowRecordStore::open_in_memory().unwrap()),
            runner.clone(),
            Redactor::local(),
            ledger,
        );

        let response = executor
            .submit(&legal_request(), "user-1", "corr-original")
            .await
            .unwrap();
        let task_id = response.approval_task_id.unwrap();
        executor
            .approve(&task_id, json!({}), "approver", "corr-approve")
            .await
            .unwrap();
        assert_eq!(
            runner.0.lock().unwrap().as_deref(),
            Some("corr-original")
        );
    }

    #[tokio::test]
    async fn test_approved_but_failed() {
        let runner = Arc::new(CountingRunner::new(true));
        let (executor, _) = executor(runner);
        let response = executor
            .submit(&legal_request(), "user-1", "corr-1")
            .await
            .unwrap();
        let task_id = response.approval_task_id.unwrap();
        let approved = executor
            .approve(&task_id, json!({}), "approver", "corr-2")
            .await
            .unwrap();
        assert_eq!(approved.status, "approved_but_failed");
        assert!(approved.error.is_some());

        let status = executor.status(&approved.workflow_id).await.unwrap();
        assert_eq!(status.status, "approved_but_failed");
    }

    #[tokio::test]
    async fn test_reject_terminates_in_failed() {
        let runner = Arc::new(CountingRunner::new(false));
        let (executor, _) = executor(runner.clone());
        let response = executor
            .submit(&legal_request(), "user-1", "corr-1")
            .await
            .unwrap();
        let task_id = response.approval_task_id.unwrap();

        let rejected = executor.reject(&task_id, "reviewer", "corr-2").await.unwrap();
        assert_eq!(rejected.status, "rejected");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);

        let status = executor.status(&response.workflow_id).await.unwrap();
        assert_eq!(status.status, "failed");

        let approve_after = executor
            .approve(&task_id, json!({}), "approver", "corr-3")
            .await
            .unwrap();
        assert_eq!(approve_after.status, "rejected");
    }

    #[tokio::test]
    async fn test_payload_is_redacted_before_persisting() {
        let runner = Arc::new(CountingRunner::new(false));
        let ledger = Arc::new(LedgerService::new(LedgerStore::open_in_memory().unwrap()));
        let records = Arc::new(WorkflowRecordStore::open_in_memory().unwrap());
        let executor = WorkflowExecutor::new(
            HilPolicy::default(),
            Arc::new(MemoryApprovalStore::new()),
            records.clone(),
            runner,
            Redactor::local(),
            ledger,
        );

        let request = WorkflowExecutionRequest {
            workflow_pack_id: "title.pack".into(),
            workflow_type: "legal".into(),
            payload: json!({"deed": "grantor ssn 123-45-6789"}),
            metadata: None,
        };
        let response = executor.submit(&request, "user-1", "corr-1").await.unwrap();
        let record = records.get(&response.workflow_id).unwrap().unwrap();
        assert_eq!(record.payload["deed"], "grantor ssn ***-**-6789");
    }

    #[tokio::test]
    async fn test_unknown_workflow_status_not_found() {
        let runner = Arc::new(CountingRunner::new(false));
        let (executor, _) = executor(runner);
        let err = executor.status("missing").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
