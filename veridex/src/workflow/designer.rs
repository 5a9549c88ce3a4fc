//! Designer artifact compilation.
//!
//! Accepts a designer workflow artifact, validates it against the pack
//! schema, calls the pack compiler, and on success submits an orchestrator
//! job. Pack creation is retained even when the orchestrator submission
//! fails; the response then carries a null job id and a diagnostic message.

use std::sync::Arc;

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::hash_value;
use crate::errors::{ServiceError, ServiceResult};
use crate::http::GatewayClient;
use crate::ledger::{AppendRequest, AuditSink};

static PACK_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::json!({
        "type": "object",
        "required": ["name", "steps"],
        "properties": {
            "name": {"type": "string", "minLength": 1},
            "version": {"type": "string"},
            "steps": {
                "type": "array",
                "minItems": 1,
                "items": {
                    "type": "object",
                    "required": ["id", "kind"],
                    "properties": {
                        "id": {"type": "string", "minLength": 1},
                        "kind": {"type": "string", "minLength": 1}
                    }
                }
            }
        }
    })
});

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignerCompileRequest {
    /// Workflow artifact produced by the designer front-end.
    pub designer_output: Value,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_validate_schema")]
    pub validate_schema: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn default_output_format() -> String {
    "json".to_string()
}

fn default_validate_schema() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignerCompileResponse {
    /// compiled | failed | validation_error
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
    #[serde(default)]
    pub orchestrator_job_id: Option<String>,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Pack compiler and orchestrator submission seam.
#[async_trait::async_trait]
pub trait PackPipeline: Send + Sync {
    async fn compile_pack(
        &self,
        source: &Value,
        format: &str,
        metadata: &Value,
        correlation_id: &str,
    ) -> ServiceResult<Value>;

    async fn submit_job(&self, job: &Value, correlation_id: &str) -> ServiceResult<Value>;
}

pub struct HttpPackPipeline {
    client: Arc<GatewayClient>,
}

impl HttpPackPipeline {
    pub fn new(client: Arc<GatewayClient>) -> Self {
        HttpPackPipeline { client }
    }
}

#[async_trait::async_trait]
impl PackPipeline for HttpPackPipeline {
    async fn compile_pack(
        &self,
        source: &Value,
        format: &str,
        metadata: &Value,
        correlation_id: &str,
    ) -> ServiceResult<Value> {
        let body = serde_json::json!({
            "source": source,
            "format": format,
            "metadata": metadata,
        });
        self.client
            .post_json("/packs/compile", &body, Some(correlation_id), None)
            .await
    }

    async fn submit_job(&self, job: &Value, correlation_id: &str) -> ServiceResult<Value> {
        self.client
            .post_json("/orchestrator/jobs/submit", job, Some(correlation_id), None)
            .await
    }
}

pub struct DesignerCompiler {
    schema: JSONSchema,
    pipeline: Arc<dyn PackPipeline>,
    audit: Arc<dyn AuditSink>,
}

impl DesignerCompiler {
    pub fn new(pipeline: Arc<dyn PackPipeline>, audit: Arc<dyn AuditSink>) -> ServiceResult<Self> {
        let schema = JSONSchema::compile(&PACK_SCHEMA)
            .map_err(|e| ServiceError::Internal(format!("pack schema failed to compile: {}", e)))?;
        Ok(DesignerCompiler {
            schema,
            pipeline,
            audit,
        })
    }

    fn validate(&self, artifact: &Value) -> Vec<String> {
        match self.schema.validate(artifact) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect(),
        }
    }

    pub async fn compile(
        &self,
        request: &DesignerCompileRequest,
        user_id: &str,
        correlation_id: &str,
    ) -> ServiceResult<DesignerCompileResponse> {
        let input_hash = hash_value(&serde_json::to_value(request)?)?;

        let validation_errors = if request.validate_schema {
            self.validate(&request.designer_output)
        } else {
            Vec::new()
        };

        let response = if !validation_errors.is_empty() {
            DesignerCompileResponse {
                status: "validation_error".into(),
                pack_id: None,
                orchestrator_job_id: None,
                validation_errors,
                correlation_id: correlation_id.to_string(),
                message: Some("Schema validation failed".into()),
            }
        } else {
            self.compile_and_submit(request, user_id, correlation_id).await
        };

        let output_hash = hash_value(&serde_json::to_value(&response)?)?;
        let (event_type, action) = if response.status == "failed" {
            ("workflow.failed", "designer_compile_failed")
        } else {
            ("workflow.step", "designer_compile")
        };
        let audit_event = AppendRequest::new(
            "platform",
            event_type,
            serde_json::json!({
                "action": action,
                "pack_id": response.pack_id,
                "orchestrator_job_id": response.orchestrator_job_id,
                "validation_errors": response.validation_errors,
                "input_hash": input_hash,
                "output_hash": output_hash,
            }),
        )
        .with_user(user_id)
        .with_correlation(correlation_id);
        if let Err(e) = self.audit.record(audit_event).await {
            log::warn!("audit append for designer compile failed: {}", e);
        }

        Ok(response)
    }

    async fn compile_and_submit(
        &self,
        request: &DesignerCompileRequest,
        user_id: &str,
        correlation_id: &str,
    ) -> DesignerCompileResponse {
        let metadata = request.metadata.clone().unwrap_or(Value::Null);
        let compiled = self
            .pipeline
            .compile_pack(
                &request.designer_output,
                &request.output_format,
                &metadata,
                correlation_id,
            )
            .await;

        let pack_id = match compiled {
            Ok(value) => match value.get("pack_id").and_then(Value::as_str) {
                Some(pack_id) => pack_id.to_string(),
                None => {
                    return DesignerCompileResponse {
                        status: "failed".into(),
                        pack_id: None,
                        orchestrator_job_id: None,
                        validation_errors: vec!["Pack compiler did not return pack_id".into()],
                        correlation_id: correlation_id.to_string(),
                        message: Some("Compilation failed: no pack produced".into()),
                    };
                }
            },
            Err(e) => {
                log::error!("pack compilation failed: {}", e);
                return DesignerCompileResponse {
                    status: "failed".into(),
                    pack_id: None,
                    orchestrator_job_id: None,
                    validation_errors: vec![e.to_string()],
                    correlation_id: correlation_id.to_string(),
                    message: Some(format!("Compilation failed: {}", e)),
                };
            }
        };

        let job = serde_json::json!({
            "job_type": "workflow_pack_execution",
            "job_id": Uuid::new_v4().to_string(),
            "pack_id": pack_id,
            "source": "designer_compilation",
            "requester": user_id,
            "metadata": metadata,
            "correlation_id": correlation_id,
        });

        // Pack creation is retained even when submission fails.
        let orchestrator_job_id = match self.pipeline.submit_job(&job, correlation_id).await {
            Ok(value) => value
                .get("job_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            Err(e) => {
                log::warn!("failed to submit compiled pack to orchestrator: {}", e);
                None
            }
        };

        let message = if orchestrator_job_id.is_some() {
            "Successfully compiled and submitted to Orchestrator"
        } else {
            "Compiled but Orchestrator submission failed"
        };
        DesignerCompileResponse {
            status: "compiled".into(),
            pack_id: Some(pack_id),
            orchestrator_job_id,
            validation_errors: Vec::new(),
            correlation_id: correlation_id.to_string(),
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NullAuditSink;
    use serde_json::json;

    struct ScriptedPipeline {
        compile_ok: bool,
        submit_ok: bool,
    }

    #[async_trait::async_trait]
    impl PackPipeline for ScriptedPipeline {
        async fn compile_pack(
            &self,
            _source: &Value,
            _format: &str,
            _metadata: &Value,
            _correlation_id: &str,
        ) -> ServiceResult<Value> {
            if self.compile_ok {
                Ok(json!({"pack_id": "pack-123"}))
            } else {
                Err(ServiceError::UpstreamUnavailable("compiler down".into()))
            }
        }

        async fn submit_job(&self, _job: &Value, _correlation_id: &str) -> ServiceResult<Value> {
            if self.submit_ok {
                Ok(json!({"job_id": "job-9"}))
            } else {
                Err(ServiceError::UpstreamUnavailable("orchestrator down".into()))
            }
        }
    }

    fn compiler(compile_ok: bool, submit_ok: bool) -> DesignerCompiler {
        DesignerCompiler::new(
            Arc::new(ScriptedPipeline {
                compile_ok,
                submit_ok,
            }),
            Arc::new(NullAuditSink),
        )
        .unwrap()
    }

    fn valid_artifact() -> Value {
        json!({
            "name": "title-review",
            "version": "1.0",
            "steps": [{"id": "s1", "kind": "validate"}]
        })
    }

    #[tokio::test]
    async fn test_happy_path_compiles_and_submits() {
        let compiler = compiler(true, true);
        let request = DesignerCompileRequest {
            designer_output: valid_artifact(),
            output_format: "json".into(),
            validate_schema: true,
            metadata: None,
        };
        let response = compiler.compile(&request, "user-1", "corr-1").await.unwrap();
        assert_eq!(response.status, "compiled");
        assert_eq!(response.pack_id.as_deref(), Some("pack-123"));
        assert_eq!(response.orchestrator_job_id.as_deref(), Some("job-9"));
    }

    #[tokio::test]
    async fn test_validation_error_skips_compile() {
        let compiler = compiler(true, true);
        let request = DesignerCompileRequest {
            designer_output: json!({"name": "x"}),
            output_format: "json".into(),
            validate_schema: true,
            metadata: None,
        };
        let response = compiler.compile(&request, "user-1", "corr-1").await.unwrap();
        assert_eq!(response.status, "validation_error");
        assert!(response.pack_id.is_none());
        assert!(!response.validation_errors.is_empty());
    }

    #[tokio::test]
    async fn test_validation_can_be_skipped() {
        let compiler = compiler(true, true);
        let request = DesignerCompileRequest {
            designer_output: json!({"anything": true}),
            output_format: "json".into(),
            validate_schema: false,
            metadata: None,
        };
        let response = compiler.compile(&request, "user-1", "corr-1").await.unwrap();
        assert_eq!(response.status, "compiled");
    }

    #[tokio::test]
    async fn test_compile_failure() {
        let compiler = compiler(false, true);
        let request = DesignerCompileRequest {
            designer_output: valid_artifact(),
            output_format: "json".into(),
            validate_schema: true,
            metadata: None,
        };
        let response = compiler.compile(&request, "user-1", "corr-1").await.unwrap();
        assert_eq!(response.status, "failed");
        assert!(response.message.unwrap().starts_with("Compilation failed"));
    }

    #[tokio::test]
    async fn test_orchestrator_failure_retains_pack() {
        let compiler = compiler(true, false);
        let request = DesignerCompileRequest {
            designer_output: valid_artifact(),
            output_format: "json".into(),
            validate_schema: true,
            metadata: None,
        };
        let response = compiler.compile(&request, "user-1", "corr-1").await.unwrap();
        assert_eq!(response.status, "compiled");
        assert_eq!(response.pack_id.as_deref(), Some("pack-123"));
        assert!(response.orchestrator_job_id.is_none());
        assert_eq!(
            response.message.as_deref(),
            Some("Compiled but Orchestrator submission failed")
        );
    }
}
