//! Policy router.
//!
//! Given a validation request, picks a policy decision, dispatches to the
//! registered worker for the domain, and returns a normalized response:
//!
//! - **Conservative** (JSON-authoritative): static worker validation, then
//!   per-failure retrieval-grounded enrichment. Enrichment errors degrade to
//!   "no enrichment for this failure".
//! - **Hybrid** (compare): static and retrieval-grounded legs run in
//!   parallel, JSON stays authoritative, and a comparison delta is attached.
//! - **Agentic** (AI-primary): retrieval-grounded validation gated by mean
//!   confidence, with conservative fallback below the threshold or on error.
//!
//! Mode fallback is never surfaced as an error; it is communicated through
//! `fallback_reason` and `mode_executed`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::{ServiceError, ServiceResult};
use crate::http::TokenProvider;
use crate::registry::{select_registration, Registry, RulePackRegistration};
use crate::rulepack::{
    ExplanationRequest, ExplanationResponse, HttpRulePackClient, RagValidationData,
    RulePackChannel, SeverityCounts, ValidationMode, ValidationRequest, ValidationResponse,
    ValidationStats,
};

pub mod merge;

pub use merge::{average_confidence, merge_hybrid_results};

/// The router's chosen strategy after the capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyDecision {
    Conservative,
    Hybrid,
    Agentic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct RouterHealth {
    pub router_status: RouterStatus,
    pub connected_rulepacks: usize,
    pub rulepack_health: HashMap<String, Value>,
}

/// Creates worker channels from registrations; the seam tests stub out.
#[async_trait::async_trait]
pub trait RulePackConnector: Send + Sync {
    async fn connect(
        &self,
        registration: &RulePackRegistration,
    ) -> ServiceResult<Arc<dyn RulePackChannel>>;
}

/// Production connector dialing the registered HTTP endpoint.
pub struct HttpRulePackConnector {
    token_provider: Arc<dyn TokenProvider>,
}

impl HttpRulePackConnector {
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> Self {
        HttpRulePackConnector { token_provider }
    }
}

#[async_trait::async_trait]
impl RulePackConnector for HttpRulePackConnector {
    async fn connect(
        &self,
        registration: &RulePackRegistration,
    ) -> ServiceResult<Arc<dyn RulePackChannel>> {
        let client = HttpRulePackClient::connect(
            registration.domain.clone(),
            &registration.endpoint,
            self.token_provider.clone(),
        )?;
        Ok(Arc::new(client))
    }
}

#[derive(Clone)]
struct PoolEntry {
    pack: Arc<dyn RulePackChannel>,
    registration: RulePackRegistration,
}

pub struct PolicyRouter {
    registry: Arc<dyn Registry>,
    connector: Arc<dyn RulePackConnector>,
    // Shared-mutable client cache: concurrent read, serialized insert.
    clients: RwLock<HashMap<String, PoolEntry>>,
    // Per-domain initialization guards so first use never connects twice.
    init_guards: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl PolicyRouter {
    pub fn new(registry: Arc<dyn Registry>, connector: Arc<dyn RulePackConnector>) -> Self {
        PolicyRouter {
            registry,
            connector,
            clients: RwLock::new(HashMap::new()),
            init_guards: DashMap::new(),
        }
    }

    /// Route one validation request; the returned response always echoes the
    /// caller's `request_id` and requested mode.
    pub async fn route_validation(
        &self,
        request: &ValidationRequest,
    ) -> ServiceResult<ValidationResponse> {
        let entry = self.pool_entry(&request.domain).await?;
        let policy = Self::determine_policy(request, &entry.registration);

        log::info!(
            "routing validation for domain '{}' with policy '{:?}' and mode '{}'",
            request.domain,
            policy,
            request.options.mode
        );

        let mut response = match policy {
            PolicyDecision::Conservative => self.route_conservative(request, &entry).await?,
            PolicyDecision::Hybrid => self.route_hybrid(request, &entry).await?,
            PolicyDecision::Agentic => self.route_agentic(request, &entry).await?,
        };
        response.request_id = request.request_id.clone();
        response.mode_requested = request.options.mode;
        Ok(response)
    }

    /// Route an explanation request to the domain's worker.
    pub async fn route_explanation(
        &self,
        domain: &str,
        request: &ExplanationRequest,
    ) -> ServiceResult<ExplanationResponse> {
        let entry = self.pool_entry(domain).await?;
        entry.pack.explain(request).await
    }

    fn determine_policy(
        request: &ValidationRequest,
        registration: &RulePackRegistration,
    ) -> PolicyDecision {
        match request.options.mode {
            ValidationMode::Static => PolicyDecision::Conservative,
            ValidationMode::Hybrid => PolicyDecision::Hybrid,
            ValidationMode::Agentic => {
                if registration.supports(ValidationMode::Agentic) {
                    PolicyDecision::Agentic
                } else {
                    PolicyDecision::Hybrid
                }
            }
        }
    }

    /// Mode 1: JSON rules are authoritative; retrieval enriches failures.
    async fn route_conservative(
        &self,
        request: &ValidationRequest,
        entry: &PoolEntry,
    ) -> ServiceResult<ValidationResponse> {
        let static_request = request.with_mode(ValidationMode::Static);
        let mut response = entry.pack.validate(&static_request).await?;

        for failure in &mut response.failures {
            if failure.ai_explanation.as_deref().map_or(false, |e| !e.is_empty()) {
                continue;
            }
            let explain_request = ExplanationRequest {
                domain: request.domain.clone(),
                failure: failure.clone(),
            };
            match entry.pack.explain(&explain_request).await {
                Ok(explanation) => {
                    failure.ai_explanation = Some(explanation.explanation);
                    failure.ai_recommendation = Some(explanation.recommendation);
                    failure.ai_confidence = Some(explanation.confidence);
                    failure
                        .policy_references
                        .extend(explanation.policy_references);
                    failure.suggested_actions.extend(explanation.suggested_actions);
                }
                Err(e) => {
                    log::warn!(
                        "failed to enrich failure {} for domain {}: {}",
                        failure.rule_id,
                        request.domain,
                        e
                    );
                }
            }
        }

        response.mode_executed = ValidationMode::Static;
        Ok(response)
    }

    /// Mode 2: both legs in parallel, both observed, JSON authoritative.
    async fn route_hybrid(
        &self,
        request: &ValidationRequest,
        entry: &PoolEntry,
    ) -> ServiceResult<ValidationResponse> {
        let static_request = request.with_mode(ValidationMode::Static);
        let (json_result, rag_result) = tokio::join!(
            entry.pack.validate(&static_request),
            entry.pack.validate_rag(request)
        );

        let json_response = match json_result {
            Ok(response) => response,
            Err(e) => {
                log::error!("hybrid static leg failed for {}: {}", request.domain, e);
                return self.route_conservative(request, entry).await;
            }
        };

        match rag_result {
            Ok(rag) => {
                let mut merged = merge_hybrid_results(json_response, &rag);
                merged.mode_executed = ValidationMode::Hybrid;
                Ok(merged)
            }
            Err(e) => {
                log::warn!("RAG validation failed in hybrid mode: {}", e);
                let mut response = json_response;
                response.mode_executed = ValidationMode::Static;
                response.fallback_reason = Some(format!("RAG validation error: {}", e));
                Ok(response)
            }
        }
    }

    /// Mode 3: AI primary with confidence-gated conservative fallback.
    async fn route_agentic(
        &self,
        request: &ValidationRequest,
        entry: &PoolEntry,
    ) -> ServiceResult<ValidationResponse> {
        let rag = match entry.pack.validate_rag(request).await {
            Ok(rag) => rag,
            Err(e) => {
                log::warn!("agentic validation failed, falling back to conservative: {}", e);
                let mut fallback = self.route_conservative(request, entry).await?;
                fallback.fallback_reason = Some(format!("RAG validation error: {}", e));
                return Ok(fallback);
            }
        };

        let avg_confidence = average_confidence(&rag.failures);
        if avg_confidence < request.options.confidence_threshold {
            log::info!(
                "RAG confidence {:.3} below threshold {:.3}, falling back to JSON",
                avg_confidence,
                request.options.confidence_threshold
            );
            let mut fallback = self.route_conservative(request, entry).await?;
            fallback.fallback_reason = Some(format!("Low RAG confidence: {:.3}", avg_confidence));
            return Ok(fallback);
        }

        Ok(Self::rag_data_to_response(request, rag, avg_confidence))
    }

    fn rag_data_to_response(
        request: &ValidationRequest,
        rag: RagValidationData,
        avg_confidence: f64,
    ) -> ValidationResponse {
        let summary = ValidationStats {
            total_records: 1,
            records_processed: 1,
            records_failed: rag.failures.len() as u64,
            counts_by_severity: SeverityCounts::tally(&rag.failures),
            processing_time_ms: rag.processing_time_ms,
            mode_used: ValidationMode::Agentic,
            avg_ai_confidence: Some(avg_confidence),
        };
        ValidationResponse {
            request_id: request.request_id.clone(),
            domain: request.domain.clone(),
            success: true,
            summary,
            failures: rag.failures,
            mode_requested: request.options.mode,
            mode_executed: ValidationMode::Agentic,
            fallback_reason: None,
            comparison_delta: None,
            completed_at: Utc::now(),
        }
    }

    /// Get-or-create the pooled worker channel for a domain. The cache
    /// permits concurrent reads; first-use creation is serialized per domain.
    async fn pool_entry(&self, domain: &str) -> ServiceResult<PoolEntry> {
        if let Some(entry) = self.clients.read().await.get(domain) {
            return Ok(entry.clone());
        }

        let guard = self
            .init_guards
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _init = guard.lock().await;

        // Another request may have connected while we waited on the guard.
        if let Some(entry) = self.clients.read().await.get(domain) {
            return Ok(entry.clone());
        }

        let registrations = self.registry.discover(domain).await?;
        let registration = select_registration(&registrations)
            .ok_or_else(|| ServiceError::no_rulepack(domain))?
            .clone();

        let pack = self.connector.connect(&registration).await?;
        pack.initialize().await?;

        let entry = PoolEntry { pack, registration };
        self.clients
            .write()
            .await
            .insert(domain.to_string(), entry.clone());

        log::info!("connected worker for domain '{}' at {}", domain, entry.registration.endpoint);
        Ok(entry)
    }

    /// Aggregate health: unhealthy when the registry is unreachable,
    /// degraded when any connected worker's health check throws.
    pub async fn health_check(&self) -> RouterHealth {
        let mut status = RouterStatus::Healthy;
        if self.registry.health_check().await.is_err() {
            status = RouterStatus::Unhealthy;
        }

        let clients = self.clients.read().await;
        let mut rulepack_health = HashMap::new();
        for (domain, entry) in clients.iter() {
            match entry.pack.health_check().await {
                Ok(health) => {
                    rulepack_health.insert(domain.clone(), health);
                }
                Err(e) => {
                    rulepack_health.insert(
                        domain.clone(),
                        serde_json::json!({"status": "unhealthy", "error": e.to_string()}),
                    );
                    if status == RouterStatus::Healthy {
                        status = RouterStatus::Degraded;
                    }
                }
            }
        }

        RouterHealth {
            router_status: status,
            connected_rulepacks: clients.len(),
            rulepack_health,
        }
    }

    /// Disconnect every pooled client and clear the cache.
    pub async fn cleanup(&self) {
        let mut clients = self.clients.write().await;
        for (domain, entry) in clients.drain() {
            if let Err(e) = entry.pack.shutdown().await {
                log::warn!("shutdown of worker '{}' failed: {}", domain, e);
            }
        }
        self.init_guards.clear();
        log::info!("policy router cleanup completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, RegistrationStatus};
    use crate::rulepack::{
        RagValidator, RulePack, RulePackInfo, Severity, ValidationFailure,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted worker: static failures plus a configurable RAG leg.
    struct ScriptedPack {
        static_failures: Vec<ValidationFailure>,
        rag: Option<RagValidationData>,
        explain_works: bool,
        validate_calls: AtomicUsize,
    }

    impl ScriptedPack {
        fn new(static_failures: Vec<ValidationFailure>, rag: Option<RagValidationData>) -> Self {
            ScriptedPack {
                static_failures,
                rag,
                explain_works: true,
                validate_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl RulePack for ScriptedPack {
        async fn initialize(&self) -> ServiceResult<()> {
            Ok(())
        }

        async fn validate(&self, request: &ValidationRequest) -> ServiceResult<ValidationResponse> {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.options.mode, ValidationMode::Static);
            let failures = self.static_failures.clone();
            Ok(ValidationResponse {
                request_id: request.request_id.clone(),
                domain: request.domain.clone(),
                success: failures.is_empty(),
                summary: ValidationStats {
                    total_records: 1,
                    records_processed: 1,
                    records_failed: failures.len() as u64,
                    counts_by_severity: SeverityCounts::tally(&failures),
                    processing_time_ms: 3,
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
            if !self.explain_works {
                return Err(ServiceError::UpstreamUnavailable("explain down".into()));
            }
            Ok(ExplanationResponse {
                explanation: format!("{} explained", request.failure.rule_id),
                recommendation: "fix it".into(),
                confidence: 0.9,
                policy_references: vec!["TFM-2025".into()],
                suggested_actions: vec!["resubmit".into()],
            })
        }

        async fn get_info(&self) -> ServiceResult<RulePackInfo> {
            Ok(RulePackInfo {
                domain: "gtas".into(),
                name: "scripted".into(),
                version: "1.0".into(),
                supported_modes: vec![ValidationMode::Static],
                rule_count: 1,
                categories: vec![],
            })
        }

        async fn get_metadata(&self) -> ServiceResult<Value> {
            Ok(serde_json::json!({}))
        }

        async fn health_check(&self) -> ServiceResult<Value> {
            Ok(serde_json::json!({"status": "healthy"}))
        }

        async fn shutdown(&self) -> ServiceResult<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl RagValidator for ScriptedPack {
        async fn validate_rag(&self, _request: &ValidationRequest) -> ServiceResult<RagValidationData> {
            self.rag
                .clone()
                .ok_or_else(|| ServiceError::UpstreamUnavailable("rag leg down".into()))
        }
    }

    struct FixedConnector(Arc<ScriptedPack>);

    #[async_trait::async_trait]
    impl RulePackConnector for FixedConnector {
        async fn connect(
            &self,
            _registration: &RulePackRegistration,
        ) -> ServiceResult<Arc<dyn RulePackChannel>> {
            Ok(self.0.clone())
        }
    }

    async fn router_with(
        pack: Arc<ScriptedPack>,
        supported_modes: Vec<ValidationMode>,
    ) -> PolicyRouter {
        let registry = InMemoryRegistry::new();
        registry
            .register(RulePackRegistration {
                domain: "gtas".into(),
                endpoint: "http://worker".into(),
                status: RegistrationStatus::Active,
                supported_modes,
                rule_count: 3,
                categories: vec![],
            })
            .await
            .unwrap();
        PolicyRouter::new(Arc::new(registry), Arc::new(FixedConnector(pack)))
    }

    fn static_failure(rule_id: &str) -> ValidationFailure {
        ValidationFailure::new(rule_id, Severity::Error, "bad account")
    }

    #[tokio::test]
    async fn test_unknown_domain_fails_before_policy() {
        let pack = Arc::new(ScriptedPack::new(vec![], None));
        let router = router_with(pack, vec![ValidationMode::Static]).await;
        let request = ValidationRequest::new(
            "unknown",
            serde_json::json!({}),
            ValidationMode::Static,
        );
        let err = router.route_validation(&request).await.unwrap_err();
        assert!(err.to_string().contains("NO_RULEPACK_FOR_DOMAIN"));
    }

    #[tokio::test]
    async fn test_conservative_enriches_failures() {
        let pack = Arc::new(ScriptedPack::new(vec![static_failure("ACC_001")], None));
        let router = router_with(pack, vec![ValidationMode::Static]).await;
        let request = ValidationRequest::new(
            "gtas",
            serde_json::json!({"account": "12345"}),
            ValidationMode::Static,
        );
        let response = router.route_validation(&request).await.unwrap();
        assert_eq!(response.mode_executed, ValidationMode::Static);
        assert_eq!(response.failures.len(), 1);
        let failure = &response.failures[0];
        assert_eq!(failure.ai_explanation.as_deref(), Some("ACC_001 explained"));
        assert_eq!(failure.policy_references, vec!["TFM-2025".to_string()]);
    }

    #[tokio::test]
    async fn test_conservative_enrichment_error_is_non_fatal() {
        let mut pack = ScriptedPack::new(vec![static_failure("ACC_001")], None);
        pack.explain_works = false;
        let router = router_with(Arc::new(pack), vec![ValidationMode::Static]).await;
        let request =
            ValidationRequest::new("gtas", serde_json::json!({}), ValidationMode::Static);
        let response = router.route_validation(&request).await.unwrap();
        assert!(response.failures[0].ai_explanation.is_none());
    }

    #[tokio::test]
    async fn test_hybrid_merges_and_attaches_delta() {
        let mut rag_failure = static_failure("ACC_001");
        rag_failure.ai_explanation = Some("from rag".into());
        rag_failure.ai_confidence = Some(0.9);
        let pack = Arc::new(ScriptedPack::new(
            vec![static_failure("ACC_001"), static_failure("ACC_002")],
            Some(RagValidationData {
                failures: vec![rag_failure],
                processing_time_ms: 8,
            }),
        ));
        let router = router_with(pack, vec![ValidationMode::Hybrid]).await;
        let request =
            ValidationRequest::new("gtas", serde_json::json!({}), ValidationMode::Hybrid);
        let response = router.route_validation(&request).await.unwrap();
        assert_eq!(response.mode_executed, ValidationMode::Hybrid);
        let delta = response.comparison_delta.as_ref().unwrap();
        assert_eq!(delta.common, vec!["ACC_001".to_string()]);
        assert_eq!(delta.json_only, vec!["ACC_002".to_string()]);
        assert_eq!(
            response.failures[0].ai_explanation.as_deref(),
            Some("from rag")
        );
    }

    #[tokio::test]
    async fn test_hybrid_rag_failure_degrades_to_static() {
        let pack = Arc::new(ScriptedPack::new(vec![static_failure("ACC_001")], None));
        let router = router_with(pack, vec![ValidationMode::Hybrid]).await;
        let request =
            ValidationRequest::new("gtas", serde_json::json!({}), ValidationMode::Hybrid);
        let response = router.route_validation(&request).await.unwrap();
        assert_eq!(response.mode_executed, ValidationMode::Static);
        assert!(response
            .fallback_reason
            .as_deref()
            .unwrap()
            .starts_with("RAG validation error:"));
    }

    #[tokio::test]
    async fn test_agentic_low_confidence_falls_back() {
        let rag = RagValidationData {
            failures: vec![
                static_failure("ACC_001").with_confidence(0.5),
                static_failure("ACC_002").with_confidence(0.5),
            ],
            processing_time_ms: 8,
        };
        let pack = Arc::new(ScriptedPack::new(vec![static_failure("ACC_001")], Some(rag)));
        let router = router_with(pack, vec![ValidationMode::Agentic]).await;
        let mut request =
            ValidationRequest::new("gtas", serde_json::json!({}), ValidationMode::Agentic);
        request.options.confidence_threshold = 0.8;
        let response = router.route_validation(&request).await.unwrap();
        assert_eq!(response.mode_executed, ValidationMode::Static);
        assert_eq!(
            response.fallback_reason.as_deref(),
            Some("Low RAG confidence: 0.500")
        );
        assert_eq!(response.mode_requested, ValidationMode::Agentic);
    }

    #[tokio::test]
    async fn test_agentic_high_confidence_stays_agentic() {
        let rag = RagValidationData {
            failures: vec![static_failure("ACC_001").with_confidence(0.95)],
            processing_time_ms: 8,
        };
        let pack = Arc::new(ScriptedPack::new(vec![], Some(rag)));
        let router = router_with(pack, vec![ValidationMode::Agentic]).await;
        let request =
            ValidationRequest::new("gtas", serde_json::json!({}), ValidationMode::Agentic);
        let response = router.route_validation(&request).await.unwrap();
        assert_eq!(response.mode_executed, ValidationMode::Agentic);
        assert_eq!(response.summary.avg_ai_confidence, Some(0.95));
    }

    #[tokio::test]
    async fn test_agentic_unsupported_downgrades_to_hybrid() {
        let rag = RagValidationData::default();
        let pack = Arc::new(ScriptedPack::new(vec![], Some(rag)));
        let router =
            router_with(pack, vec![ValidationMode::Static, ValidationMode::Hybrid]).await;
        let request =
            ValidationRequest::new("gtas", serde_json::json!({}), ValidationMode::Agentic);
        let response = router.route_validation(&request).await.unwrap();
        // Registration does not list agentic, so the hybrid path ran.
        assert_eq!(response.mode_executed, ValidationMode::Hybrid);
    }

    #[tokio::test]
    async fn test_client_pool_connects_once_per_domain() {
        let pack = Arc::new(ScriptedPack::new(vec![], Some(RagValidationData::default())));
        let router = Arc::new(router_with(pack.clone(), vec![ValidationMode::Static]).await);
        let request =
            ValidationRequest::new("gtas", serde_json::json!({}), ValidationMode::Static);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = router.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                router.route_validation(&request).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(pack.validate_calls.load(Ordering::SeqCst), 8);

        let health = router.health_check().await;
        assert_eq!(health.connected_rulepacks, 1);
        assert_eq!(health.router_status, RouterStatus::Healthy);

        router.cleanup().await;
        let health = router.health_check().await;
        assert_eq!(health.connected_rulepacks, 0);
    }
}
