//! Tiered OCR pipeline.
//!
//! Text extraction escalates from a fast engine to a vision-model engine on
//! low confidence, and queues for human review when even the final result is
//! below the review gate. Results are cached by document content hash so a
//! re-submitted document never reprocesses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod engine;
pub mod pipeline;
pub mod preprocess;
pub mod store;

pub use engine::{
    FastTierOcr, HttpOcrEngine, OcrExtraction, PageRenderer, UnconfiguredTier, VisionTierOcr,
};
pub use pipeline::{OcrOutcome, OcrPipeline, OcrRequest};
pub use store::OcrStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    Pending,
    ProcessingFast,
    ProcessingVision,
    AwaitingReview,
    Completed,
    Failed,
}

impl OcrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrStatus::Pending => "pending",
            OcrStatus::ProcessingFast => "processing_fast",
            OcrStatus::ProcessingVision => "processing_vision",
            OcrStatus::AwaitingReview => "awaiting_review",
            OcrStatus::Completed => "completed",
            OcrStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => OcrStatus::Pending,
            "processing_fast" => OcrStatus::ProcessingFast,
            "processing_vision" => OcrStatus::ProcessingVision,
            "awaiting_review" => OcrStatus::AwaitingReview,
            "completed" => OcrStatus::Completed,
            "failed" => OcrStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrTier {
    Tesseract,
    AiVision,
    HumanReview,
}

impl OcrTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrTier::Tesseract => "tesseract",
            OcrTier::AiVision => "ai_vision",
            OcrTier::HumanReview => "human_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "tesseract" => OcrTier::Tesseract,
            "ai_vision" => OcrTier::AiVision,
            "human_review" => OcrTier::HumanReview,
            _ => return None,
        })
    }
}

/// One extraction job. Confidence is on a 0-100 scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrJob {
    pub id: String,
    pub tenant_id: String,
    /// SHA-256 of the raw document bytes.
    pub document_hash: String,
    pub status: OcrStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_used: Option<OcrTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_fields: Option<Value>,
    /// Per-page and job-level warnings, keyed by source.
    #[serde(default)]
    pub warnings: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Human correction of a low-confidence job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrReview {
    pub id: String,
    pub job_id: String,
    pub reviewer_id: String,
    pub reviewed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected_fields: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<String>,
    pub confidence_after_review: f64,
}

/// Cached result keyed by document hash.
#[derive(Debug, Clone, Serialize)]
pub struct OcrCacheEntry {
    pub document_hash: String,
    pub extracted_text: String,
    pub extracted_fields: Value,
    pub confidence: f64,
    pub tier_used: OcrTier,
    pub page_count: i64,
    pub processing_time_ms: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub hit_count: i64,
}
