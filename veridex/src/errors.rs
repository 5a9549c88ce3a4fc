//! Platform-wide error kinds.
//!
//! Every subsystem boundary returns [`ServiceError`]; the HTTP layer maps the
//! kind to a status code and a `{"detail": ...}` body. Error messages must not
//! echo pre-redaction payload values.

use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Request shape validation failed (bad limit, missing input, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown domain, workflow, approval task, document, or job.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Role/scope mismatch.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Downstream HTTP 5xx or timeout after retries were exhausted.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Chain-hash collision or stale previous_hash on a ledger append.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Ledger verification mismatch.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Fatal routing error raised before any policy is selected.
    pub fn no_rulepack(domain: &str) -> Self {
        ServiceError::NotFound(format!("NO_RULEPACK_FOR_DOMAIN: {}", domain))
    }

    /// HTTP status code the gateway surfaces for this kind.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::InvalidInput(_) => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Unauthenticated(_) => 401,
            ServiceError::Unauthorized(_) => 403,
            ServiceError::UpstreamUnavailable(_) => 503,
            ServiceError::Conflict(_) => 409,
            ServiceError::IntegrityFailure(_) => 500,
            ServiceError::Internal(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Internal(format!("storage error: {}", e))
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        ServiceError::Internal(format!("serialization error: {}", e))
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.status().map_or(false, |s| s.is_server_error()) {
            ServiceError::UpstreamUnavailable(e.to_string())
        } else {
            ServiceError::Internal(format!("http client error: {}", e))
        }
    }
}
