//! HTTP client speaking the worker contract.

use std::sync::Arc;

use serde_json::Value;

use super::{
    ExplanationRequest, ExplanationResponse, RagValidationData, RagValidator, RulePack,
    RulePackInfo, ValidationRequest, ValidationResponse,
};
use crate::errors::{ServiceError, ServiceResult};
use crate::http::{GatewayClient, TokenProvider};

/// Client for one registered worker endpoint.
pub struct HttpRulePackClient {
    domain: String,
    client: GatewayClient,
}

impl HttpRulePackClient {
    pub fn connect(
        domain: impl Into<String>,
        endpoint: &str,
        token_provider: Arc<dyn TokenProvider>,
    ) -> ServiceResult<Self> {
        Ok(HttpRulePackClient {
            domain: domain.into(),
            client: GatewayClient::new(endpoint, token_provider)?,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    fn decode<T: serde::de::DeserializeOwned>(&self, path: &str, value: Value) -> ServiceResult<T> {
        serde_json::from_value(value).map_err(|e| {
            ServiceError::UpstreamUnavailable(format!(
                "worker {} returned malformed {} payload: {}",
                self.domain, path, e
            ))
        })
    }
}

#[async_trait::async_trait]
impl RulePack for HttpRulePackClient {
    async fn initialize(&self) -> ServiceResult<()> {
        self.client.get_json("/health", None, None).await.map(|_| ())
    }

    async fn validate(&self, request: &ValidationRequest) -> ServiceResult<ValidationResponse> {
        let body = serde_json::to_value(request)?;
        let value = self
            .client
            .post_json("/validate", &body, Some(&request.request_id), None)
            .await?;
        self.decode("/validate", value)
    }

    async fn explain(&self, request: &ExplanationRequest) -> ServiceResult<ExplanationResponse> {
        let body = serde_json::to_value(request)?;
        let value = self.client.post_json("/explain", &body, None, None).await?;
        self.decode("/explain", value)
    }

    async fn get_info(&self) -> ServiceResult<RulePackInfo> {
        let value = self.client.get_json("/info", None, None).await?;
        self.decode("/info", value)
    }

    async fn get_metadata(&self) -> ServiceResult<Value> {
        self.client.get_json("/metadata", None, None).await
    }

    async fn health_check(&self) -> ServiceResult<Value> {
        self.client.get_json("/health", None, None).await
    }

    async fn shutdown(&self) -> ServiceResult<()> {
        // Connections are pooled inside reqwest; dropping the client is enough.
        Ok(())
    }
}

#[async_trait::async_trait]
impl RagValidator for HttpRulePackClient {
    async fn validate_rag(&self, request: &ValidationRequest) -> ServiceResult<RagValidationData> {
        let body = serde_json::to_value(request)?;
        let value = self
            .client
            .post_json("/validate-rag", &body, Some(&request.request_id), None)
            .await?;
        self.decode("/validate-rag", value)
    }
}
