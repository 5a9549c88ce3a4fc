//! Platform configuration.
//!
//! Concern-scoped config blocks with serde defaults; `from_env` covers the
//! deployment surface the services read at startup. Thresholds here are the
//! single source for the HIL amount gate and the OCR tier gates.

use serde::{Deserialize, Serialize};

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn env_flag(var: &str) -> bool {
    matches!(
        std::env::var(var).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformConfig {
    /// Gateway base URL for downstream calls.
    #[serde(default)]
    pub gateway_url: String,
    #[serde(default)]
    pub schemas_url: Option<String>,
    #[serde(default)]
    pub workflow_url: Option<String>,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub hil: HilConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            gateway_url: String::new(),
            schemas_url: None,
            workflow_url: None,
            redaction: RedactionConfig::default(),
            hil: HilConfig::default(),
            ocr: OcrConfig::default(),
            retrieval: RetrievalConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl PlatformConfig {
    pub fn from_env() -> Self {
        PlatformConfig {
            gateway_url: env_opt("VERIDEX_GATEWAY_URL").unwrap_or_default(),
            schemas_url: env_opt("VERIDEX_SCHEMAS_URL"),
            workflow_url: env_opt("VERIDEX_WORKFLOW_URL"),
            redaction: RedactionConfig {
                use_remote: env_flag("VERIDEX_USE_REMOTE_REDACTION"),
                path: env_or("VERIDEX_PII_REDACT_PATH", RedactionConfig::default().path),
            },
            hil: HilConfig {
                amount_threshold: env_or("VERIDEX_HIL_AMOUNT_THRESHOLD", 10_000.0),
            },
            ocr: OcrConfig {
                fast_threshold: env_or("VERIDEX_OCR_FAST_THRESHOLD", 80.0),
                review_threshold: env_or("VERIDEX_OCR_REVIEW_THRESHOLD", 85.0),
                review_queue_depth: env_or("VERIDEX_OCR_REVIEW_QUEUE_DEPTH", 256),
            },
            retrieval: RetrievalConfig::default(),
            log_level: env_or("LOG_LEVEL", default_log_level()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedactionConfig {
    /// Prefer the platform redaction service over local heuristics.
    #[serde(default)]
    pub use_remote: bool,
    #[serde(default = "default_redact_path")]
    pub path: String,
}

fn default_redact_path() -> String {
    "/pii/redact".to_string()
}

impl Default for RedactionConfig {
    fn default() -> Self {
        RedactionConfig {
            use_remote: false,
            path: default_redact_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HilConfig {
    /// Monetary amounts strictly above this require human approval.
    #[serde(default = "default_hil_amount")]
    pub amount_threshold: f64,
}

fn default_hil_amount() -> f64 {
    10_000.0
}

impl Default for HilConfig {
    fn default() -> Self {
        HilConfig {
            amount_threshold: default_hil_amount(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OcrConfig {
    /// Fast-tier results at or above this confidence are accepted outright.
    #[serde(default = "default_fast_threshold")]
    pub fast_threshold: f64,
    /// Final results below this confidence are queued for human review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: f64,
    #[serde(default = "default_review_queue_depth")]
    pub review_queue_depth: usize,
}

fn default_fast_threshold() -> f64 {
    80.0
}

fn default_review_threshold() -> f64 {
    85.0
}

fn default_review_queue_depth() -> usize {
    256
}

impl Default for OcrConfig {
    fn default() -> Self {
        OcrConfig {
            fast_threshold: default_fast_threshold(),
            review_threshold: default_review_threshold(),
            review_queue_depth: default_review_queue_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    /// Semantic query cache entry lifetime.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: i64,
}

fn default_top_k() -> usize {
    5
}

fn default_similarity_threshold() -> f64 {
    0.5
}

fn default_vector_weight() -> f64 {
    0.7
}

fn default_keyword_weight() -> f64 {
    0.3
}

fn default_cache_ttl_secs() -> i64 {
    3600
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        RetrievalConfig {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}
