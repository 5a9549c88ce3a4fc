//! OCR engine seams.
//!
//! The fast tier and the vision tier are external collaborators; the
//! pipeline only sees these traits. Confidence is reported on a 0-100 scale.
//! Inference calls are never retried.

use image::GrayImage;
use serde_json::Value;

use crate::errors::ServiceResult;

/// Result of extracting one page.
#[derive(Debug, Clone)]
pub struct OcrExtraction {
    pub text: String,
    /// 0-100.
    pub confidence: f64,
    /// Engine diagnostics (word/line counts, low-confidence word count, ...).
    pub metadata: Value,
}

impl OcrExtraction {
    pub fn low_confidence_words(&self) -> i64 {
        self.metadata
            .get("low_confidence_words")
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }
}

/// Fast, cheap engine tried first on every page.
#[async_trait::async_trait]
pub trait FastTierOcr: Send + Sync {
    async fn extract(&self, page: &GrayImage) -> ServiceResult<OcrExtraction>;
}

/// Accurate, expensive engine used when the fast tier's confidence is below
/// the acceptance threshold. Implementations estimate confidence from their
/// completion signals.
#[async_trait::async_trait]
pub trait VisionTierOcr: Send + Sync {
    async fn extract(
        &self,
        page: &GrayImage,
        extract_fields: Option<&[String]>,
    ) -> ServiceResult<OcrExtraction>;
}

/// Renders PDF bytes to one grayscale page image each, at 300 DPI.
pub trait PageRenderer: Send + Sync {
    fn render_pdf(&self, bytes: &[u8]) -> ServiceResult<Vec<GrayImage>>;
}

/// Remote engine contract: POST the PNG-encoded page and get back
/// `{text, confidence, metadata}`. Used for both tiers; the endpoints differ.
pub struct HttpOcrEngine {
    client: std::sync::Arc<crate::http::GatewayClient>,
    path: String,
}

impl HttpOcrEngine {
    pub fn new(client: std::sync::Arc<crate::http::GatewayClient>, path: impl Into<String>) -> Self {
        HttpOcrEngine {
            client,
            path: path.into(),
        }
    }

    fn encode_page(page: &GrayImage) -> ServiceResult<String> {
        use base64::Engine as _;
        let mut bytes = Vec::new();
        image::DynamicImage::ImageLuma8(page.clone())
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageOutputFormat::Png,
            )
            .map_err(|e| {
                crate::errors::ServiceError::Internal(format!("page encode failed: {}", e))
            })?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    async fn call(
        &self,
        page: &GrayImage,
        extract_fields: Option<&[String]>,
    ) -> ServiceResult<OcrExtraction> {
        let body = serde_json::json!({
            "image_base64": Self::encode_page(page)?,
            "extract_fields": extract_fields,
        });
        let value = self.client.post_json(&self.path, &body, None, None).await?;
        let text = value
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok(OcrExtraction {
            text,
            confidence,
            metadata: value.get("metadata").cloned().unwrap_or(Value::Null),
        })
    }
}

#[async_trait::async_trait]
impl FastTierOcr for HttpOcrEngine {
    async fn extract(&self, page: &GrayImage) -> ServiceResult<OcrExtraction> {
        self.call(page, None).await
    }
}

#[async_trait::async_trait]
impl VisionTierOcr for HttpOcrEngine {
    async fn extract(
        &self,
        page: &GrayImage,
        extract_fields: Option<&[String]>,
    ) -> ServiceResult<OcrExtraction> {
        self.call(page, extract_fields).await
    }
}

/// Placeholder for a tier with no configured backend; every call reports the
/// tier unavailable so the pipeline's escalation ladder decides what happens.
pub struct UnconfiguredTier;

#[async_trait::async_trait]
impl FastTierOcr for UnconfiguredTier {
    async fn extract(&self, _page: &GrayImage) -> ServiceResult<OcrExtraction> {
        Err(crate::errors::ServiceError::UpstreamUnavailable(
            "fast OCR tier not configured".to_string(),
        ))
    }
}
