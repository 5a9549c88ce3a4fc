//! Downstream HTTP plumbing.
//!
//! Every outbound call to a platform service goes through [`GatewayClient`],
//! which injects `Authorization: Bearer`, `X-Correlation-ID` and W3C
//! `traceparent` headers and applies bounded-backoff retries on transient
//! failures. Embedding and OCR inference calls do not go through the retry
//! path; they use their own client seams.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{ServiceError, ServiceResult};

/// Statuses retried with backoff, alongside transport errors.
const TRANSIENT_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Source of the bearer token attached to outbound requests.
///
/// Token acquisition and rotation are platform concerns; the core only ever
/// reads the current token. Tokens are single-use-rotation on the issuing
/// side, so nothing here caches them.
pub trait TokenProvider: Send + Sync {
    fn get_token(&self) -> Option<String>;
}

/// Reads a JWT from the environment (`VERIDEX_JWT`, falling back to `JWT`).
pub struct EnvTokenProvider {
    env_var: String,
}

impl EnvTokenProvider {
    pub fn new() -> Self {
        EnvTokenProvider {
            env_var: "VERIDEX_JWT".to_string(),
        }
    }

    pub fn with_var(env_var: impl Into<String>) -> Self {
        EnvTokenProvider {
            env_var: env_var.into(),
        }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenProvider for EnvTokenProvider {
    fn get_token(&self) -> Option<String> {
        std::env::var(&self.env_var)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| std::env::var("JWT").ok().filter(|t| !t.is_empty()))
    }
}

/// Token provider with a fixed token; used by tests and static deployments.
pub struct StaticTokenProvider(pub Option<String>);

impl TokenProvider for StaticTokenProvider {
    fn get_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// HTTP client for calling platform services through the gateway.
pub struct GatewayClient {
    base_url: String,
    token_provider: Arc<dyn TokenProvider>,
    timeout: Duration,
    max_retries: u32,
    backoff_factor: f64,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: &str, token_provider: Arc<dyn TokenProvider>) -> ServiceResult<Self> {
        if base_url.is_empty() {
            return Err(ServiceError::InvalidInput(
                "gateway base url must be configured".to_string(),
            ));
        }
        let timeout = Duration::from_secs(10);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Internal(format!("http client init failed: {}", e)))?;
        Ok(GatewayClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            token_provider,
            timeout,
            max_retries: 3,
            backoff_factor: 0.5,
            client,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_factor: f64) -> Self {
        self.max_retries = max_retries;
        self.backoff_factor = backoff_factor;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        correlation_id: Option<&str>,
        traceparent: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut req = self.client.request(method, url).timeout(self.timeout);
        if let Some(token) = self.token_provider.get_token() {
            req = req.bearer_auth(token);
        }
        let corr = correlation_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        req = req.header("X-Correlation-ID", corr);
        if let Some(tp) = traceparent {
            req = req.header("traceparent", tp);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req
    }

    /// Send with retries: transport errors and transient statuses retry up to
    /// `max_retries` times with `backoff_factor * attempt` seconds of delay.
    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        correlation_id: Option<&str>,
        traceparent: Option<&str>,
    ) -> ServiceResult<reqwest::Response> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let req = self.build_request(method.clone(), path, body, correlation_id, traceparent);
            match req.send().await {
                Ok(resp) => {
                    if TRANSIENT_STATUS.contains(&resp.status().as_u16())
                        && attempt <= self.max_retries
                    {
                        self.backoff(attempt).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt <= self.max_retries {
                        self.backoff(attempt).await;
                        continue;
                    }
                    return Err(ServiceError::UpstreamUnavailable(format!(
                        "{} {} failed after {} attempts: {}",
                        method, path, attempt, e
                    )));
                }
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.backoff_factor * attempt as f64;
        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
    }

    fn check_status(path: &str, status: StatusCode) -> ServiceResult<()> {
        if status.is_success() {
            return Ok(());
        }
        let detail = format!("{} returned {}", path, status.as_u16());
        Err(match status.as_u16() {
            401 => ServiceError::Unauthenticated(detail),
            403 => ServiceError::Unauthorized(detail),
            404 => ServiceError::NotFound(detail),
            409 => ServiceError::Conflict(detail),
            400 | 422 => ServiceError::InvalidInput(detail),
            s if s >= 500 || s == 429 => ServiceError::UpstreamUnavailable(detail),
            _ => ServiceError::Internal(detail),
        })
    }

    pub async fn get_json(
        &self,
        path: &str,
        correlation_id: Option<&str>,
        traceparent: Option<&str>,
    ) -> ServiceResult<Value> {
        let resp = self
            .request(reqwest::Method::GET, path, None, correlation_id, traceparent)
            .await?;
        Self::check_status(path, resp.status())?;
        Ok(resp.json().await?)
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &Value,
        correlation_id: Option<&str>,
        traceparent: Option<&str>,
    ) -> ServiceResult<Value> {
        let resp = self
            .request(
                reqwest::Method::POST,
                path,
                Some(body),
                correlation_id,
                traceparent,
            )
            .await?;
        Self::check_status(path, resp.status())?;
        Ok(resp.json().await?)
    }
}
