//! End-to-end tests over the HTTP surface with stubbed downstream
//! collaborators (rule pack worker, orchestrator runner, OCR engines).

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use veridex::config::{OcrConfig, RetrievalConfig};
use veridex::errors::ServiceResult;
use veridex::ledger::{LedgerService, LedgerStore};
use veridex::ocr::{FastTierOcr, OcrExtraction, OcrPipeline, OcrStore};
use veridex::rag::{HashingEmbedder, KnowledgeStore, RagService};
use veridex::registry::{InMemoryRegistry, RegistrationStatus, RulePackRegistration};
use veridex::router::{PolicyRouter, RulePackConnector};
use veridex::redaction::Redactor;
use veridex::rulepack::{
    ExplanationRequest, ExplanationResponse, RagValidationData, RagValidator, RulePack,
    RulePackChannel, RulePackInfo, Severity, SeverityCounts, ValidationFailure, ValidationMode,
    ValidationRequest, ValidationResponse, ValidationStats,
};
use veridex::server::{app, AppState};
use veridex::workflow::designer::PackPipeline;
use veridex::workflow::{
    DesignerCompiler, HilPolicy, MemoryApprovalStore, WorkflowExecutor, WorkflowJob,
    WorkflowRecordStore, WorkflowRunner,
};

struct StubPack;

#[async_trait::async_trait]
impl RulePack for StubPack {
    async fn initialize(&self) -> ServiceResult<()> {
        Ok(())
    }

    async fn validate(&self, request: &ValidationRequest) -> ServiceResult<ValidationResponse> {
        let failures = vec![ValidationFailure::new(
            "ACC_001",
            Severity::Error,
            "account number malformed",
        )];
        Ok(ValidationResponse {
            request_id: request.request_id.clone(),
            domain: request.domain.clone(),
            success: false,
            summary: ValidationStats {
                total_records: 1,
                records_processed: 1,
                records_failed: 1,
                counts_by_severity: SeverityCounts::tally(&failures),
                processing_time_ms: 2,
                mode_used: ValidationMode::Static,
                avg_ai_confidence: None,
            },
            failures,
            mode_requested: request.options.mode,
            mode_executed: ValidationMode::Static,
            fallback_reason: None,
            comparison_delta: None,
            completed_at: Utc::now(),
        })
    }

    async fn explain(&self, request: &ExplanationRequest) -> ServiceResult<ExplanationResponse> {
        Ok(ExplanationResponse {
            explanation: format!("{} violates the account format edit", request.failure.rule_id),
            recommendation: "correct the account number".into(),
            confidence: 0.91,
            policy_references: vec!["TFM-2025-1".into()],
            suggested_actions: vec!["resubmit".into()],
        })
    }

    async fn get_info(&self) -> ServiceResult<RulePackInfo> {
        Ok(RulePackInfo {
            domain: "gtas".into(),
            name: "stub".into(),
            version: "1.0".into(),
            supported_modes: vec![ValidationMode::Static, ValidationMode::Hybrid],
            rule_count: 1,
            categories: vec![],
        })
    }

    async fn get_metadata(&self) -> ServiceResult<Value> {
        Ok(json!({}))
    }

    async fn health_check(&self) -> ServiceResult<Value> {
        Ok(json!({"status": "healthy"}))
    }

    async fn shutdown(&self) -> ServiceResult<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl RagValidator for StubPack {
    async fn validate_rag(&self, _request: &ValidationRequest) -> ServiceResult<RagValidationData> {
        Ok(RagValidationData::default())
    }
}

struct StubConnector;

#[async_trait::async_trait]
impl RulePackConnector for StubConnector {
    async fn connect(
        &self,
        _registration: &RulePackRegistration,
    ) -> ServiceResult<Arc<dyn RulePackChannel>> {
        Ok(Arc::new(StubPack))
    }
}

struct OkRunner;

#[async_trait::async_trait]
impl WorkflowRunner for OkRunner {
    async fn execute(&self, job: &WorkflowJob) -> ServiceResult<Value> {
        Ok(json!({"status": "executed", "workflow_id": job.workflow_id}))
    }
}

struct OkPipeline;

#[async_trait::async_trait]
impl PackPipeline for OkPipeline {
    async fn compile_pack(
        &self,
        _source: &Value,
        _format: &str,
        _metadata: &Value,
        _correlation_id: &str,
    ) -> ServiceResult<Value> {
        Ok(json!({"pack_id": "pack-e2e"}))
    }

    async fn submit_job(&self, _job: &Value, _correlation_id: &str) -> ServiceResult<Value> {
        Ok(json!({"job_id": "job-e2e"}))
    }
}

struct HighConfidenceFast;

#[async_trait::async_trait]
impl FastTierOcr for HighConfidenceFast {
    async fn extract(&self, _page: &image::GrayImage) -> ServiceResult<OcrExtraction> {
        Ok(OcrExtraction {
            text: "WARRANTY DEED".into(),
            confidence: 93.0,
            metadata: json!({}),
        })
    }
}

async fn spawn_gateway() -> String {
    let registry = Arc::new(InMemoryRegistry::new());
    registry
        .register(RulePackRegistration {
            domain: "gtas".into(),
            endpoint: "http://stub".into(),
            status: RegistrationStatus::Active,
            supported_modes: vec![ValidationMode::Static, ValidationMode::Hybrid],
            rule_count: 1,
            categories: vec!["accounting".into()],
        })
        .await
        .unwrap();

    let ledger = Arc::new(LedgerService::new(LedgerStore::open_in_memory().unwrap()));
    let router = Arc::new(PolicyRouter::new(registry.clone(), Arc::new(StubConnector)));
    let workflows = Arc::new(WorkflowExecutor::new(
        HilPolicy::default(),
        Arc::new(MemoryApprovalStore::new()),
        Arc::new(WorkflowRecordStore::open_in_memory().unwrap()),
        Arc::new(OkRunner),
        Redactor::local(),
        ledger.clone(),
    ));
    let designer =
        Arc::new(DesignerCompiler::new(Arc::new(OkPipeline), ledger.clone()).unwrap());
    let rag = Arc::new(RagService::new(
        Arc::new(KnowledgeStore::open_in_memory().unwrap()),
        Arc::new(HashingEmbedder::new()),
        RetrievalConfig::default(),
    ));
    let ocr = Arc::new(OcrPipeline::new(
        Arc::new(HighConfidenceFast),
        None,
        None,
        Arc::new(OcrStore::open_in_memory().unwrap()),
        ledger.clone(),
        OcrConfig::default(),
    ));

    let state = Arc::new(AppState {
        router,
        workflows,
        designer,
        ledger,
        rag,
        ocr,
        registry,
        decisions: Default::default(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        veridex::server::axum::serve(listener, app(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_health_endpoints() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    for (path, expected) in [("/healthz", "ok"), ("/readyz", "ready"), ("/livez", "alive")] {
        let body: Value = client
            .get(format!("{}{}", base, path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], expected);
    }
}

#[tokio::test]
async fn test_validate_requires_input() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/jobs/validate", base))
        .json(&json!({"domain": "gtas", "options": {"mode": "static"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("input_data"));
}

#[tokio::test]
async fn test_conservative_validation_enriches_failures() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/jobs/validate", base))
        .header("x-correlation-id", "corr-e2e")
        .json(&json!({
            "domain": "gtas",
            "input_data": {"account": "12345"},
            "options": {"mode": "static"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["mode_executed"], "static");
    assert_eq!(body["correlation_id"], "corr-e2e");
    let failure = &body["failures"][0];
    assert_eq!(failure["rule_id"], "ACC_001");
    assert!(failure["ai_explanation"].as_str().unwrap().contains("ACC_001"));
    assert_eq!(failure["policy_references"][0], "TFM-2025-1");
}

#[tokio::test]
async fn test_unknown_domain_404() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/jobs/validate", base))
        .json(&json!({"domain": "nope", "input_data": {}, "options": {"mode": "static"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("NO_RULEPACK_FOR_DOMAIN"));
}

#[tokio::test]
async fn test_hil_workflow_approve_idempotent() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .post(format!("{}/execute-workflow", base))
        .json(&json!({
            "workflow_pack_id": "title.pack",
            "workflow_type": "legal",
            "payload": {"deed": "book 7 page 13"}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "pending_approval");
    assert_eq!(resp["requires_human_approval"], true);
    let task_id = resp["approval_task_id"].as_str().unwrap().to_string();

    let approve: Value = client
        .post(format!("{}/workflow/approve/{}", base, task_id))
        .json(&json!({"note": "reviewed"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(approve["status"], "approved_and_executed");

    let again: Value = client
        .post(format!("{}/workflow/approve/{}", base, task_id))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(again["status"], "already_approved");

    let missing = client
        .post(format!("{}/workflow/approve/not-a-task", base))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn test_hil_amount_threshold_boundary() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let at: Value = client
        .post(format!("{}/execute-workflow", base))
        .json(&json!({
            "workflow_pack_id": "ops.pack",
            "workflow_type": "operational",
            "payload": {"amount": 10000}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(at["status"], "executed");
    assert_eq!(at["requires_human_approval"], false);

    let above: Value = client
        .post(format!("{}/execute-workflow", base))
        .json(&json!({
            "workflow_pack_id": "ops.pack",
            "workflow_type": "operational",
            "payload": {"amount": 10001}
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(above["status"], "pending_approval");
}

#[tokio::test]
async fn test_ledger_append_query_verify_export() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    for i in 0..5 {
        let resp = client
            .post(format!("{}/append", base))
            .json(&json!({
                "tenant_id": "tenant-a",
                "event_type": "validation.completed",
                "event_data": {"seq": i}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["chain_hash"].as_str().unwrap().len(), 64);
    }

    let page: Value = client
        .get(format!("{}/events?tenant_id=tenant-a&limit=3&offset=0", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 5);
    assert_eq!(page["events"].as_array().unwrap().len(), 3);

    let bad = client
        .get(format!("{}/events?tenant_id=tenant-a&limit=1001", base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 422);

    let verify: Value = client
        .get(format!("{}/verify?tenant_id=tenant-a", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verify["ok"], true);
    assert_eq!(verify["checked"], 5);

    let export = client
        .get(format!("{}/export?tenant_id=tenant-a", base))
        .send()
        .await
        .unwrap();
    assert!(export
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/csv"));
    let csv = export.text().await.unwrap();
    assert!(csv.starts_with(
        "id,tenant_id,event_type,created_at,content_hash,previous_hash,chain_hash"
    ));
    assert_eq!(csv.lines().count(), 6);
}

#[tokio::test]
async fn test_failure_decision_and_feedback_validation() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let ok: Value = client
        .put(format!(
            "{}/failures/fail-123/decision?decision=accept&reason=approved",
            base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["failure_id"], "fail-123");
    assert_eq!(ok["decision"], "accept");

    let bad = client
        .put(format!(
            "{}/failures/fail-123/decision?decision=invalid_decision",
            base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);
    let body: Value = bad.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("Invalid decision"));

    let fb: Value = client
        .post(format!("{}/feedback/rag/interaction-1?feedback=helpful", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fb["feedback"], "helpful");

    let bad_fb = client
        .post(format!("{}/feedback/rag/interaction-1?feedback=meh", base))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_fb.status(), 400);
}

#[tokio::test]
async fn test_designer_compile_roundtrip() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let ok: Value = client
        .post(format!("{}/designer/compile", base))
        .json(&json!({
            "designer_output": {"name": "flow", "steps": [{"id": "s1", "kind": "validate"}]},
            "output_format": "json"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ok["status"], "compiled");
    assert_eq!(ok["pack_id"], "pack-e2e");
    assert_eq!(ok["orchestrator_job_id"], "job-e2e");

    let invalid: Value = client
        .post(format!("{}/designer/compile", base))
        .json(&json!({"designer_output": {"steps": []}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(invalid["status"], "validation_error");
}

#[tokio::test]
async fn test_rag_ingest_query_and_context_boost() {
    let base = spawn_gateway().await;
    let client = reqwest::Client::new();
    let content = "Fund balance must reconcile to the appropriation ledger each period.";

    for (title, level, module) in [
        ("Platform guide", "platform", Value::Null),
        ("DataFlow guide", "module", json!("dataflow")),
    ] {
        let resp = client
            .post(format!("{}/documents", base))
            .json(&json!({
                "document": {
                    "tenant_id": "tenant-a",
                    "level": level,
                    "module_id": module,
                    "title": title,
                    "source_type": "markdown"
                },
                "text": content
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let retrieved: Value = client
        .post(format!("{}/retrieve", base))
        .header("x-tenant-id", "tenant-a")
        .json(&json!({
            "query": content,
            "module_id": "dataflow",
            "top_k": 5
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let chunks = retrieved["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 2);
    // Identical content, so the module-matched document wins by its boost.
    assert_eq!(chunks[0]["document_title"], "DataFlow guide");
    let gap = chunks[0]["final_score"].as_f64().unwrap()
        - chunks[1]["final_score"].as_f64().unwrap();
    assert!(gap >= 0.10 - 1e-3);

    let first: Value = client
        .post(format!("{}/query", base))
        .header("x-tenant-id", "tenant-a")
        .json(&json!({"query": content, "module_id": "dataflow"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["cached"], false);

    let second: Value = client
        .post(format!("{}/query", base))
        .header("x-tenant-id", "tenant-a")
        .json(&json!({"query": content, "module_id": "dataflow"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["cached"], true);
    assert_eq!(second["response_text"], first["response_text"]);
}

#[tokio::test]
async fn test_ocr_process_and_job_lookup() {
    use base64::Engine as _;

    let base = spawn_gateway().await;
    let client = reqwest::Client::new();

    let img = image::GrayImage::from_pixel(8, 8, image::Luma([255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageOutputFormat::Png,
        )
        .unwrap();

    let resp: Value = client
        .post(format!("{}/ocr/process", base))
        .json(&json!({
            "tenant_id": "tenant-a",
            "document_data": base64::engine::general_purpose::STANDARD.encode(&bytes)
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["cached"], false);
    assert_eq!(resp["job"]["status"], "completed");
    assert_eq!(resp["job"]["tier_used"], "tesseract");

    let job_id = resp["job"]["id"].as_str().unwrap();
    let job: Value = client
        .get(format!("{}/ocr/jobs/{}", base, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["extracted_text"], "WARRANTY DEED");

    let missing = client
        .get(format!("{}/ocr/jobs/not-a-job", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}
