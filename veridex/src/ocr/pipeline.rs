//! Auto-tiering OCR pipeline.
//!
//! Per page: preprocess, run the fast tier, escalate to the vision tier when
//! the fast confidence is below the acceptance threshold. A vision failure
//! after a fast result degrades to the fast result with the job queued for
//! review; both tiers failing fails the job and writes no cache entry.
//! Multi-page documents aggregate confidence as the page maximum.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use chrono::Utc;
use image::GrayImage;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::engine::{FastTierOcr, OcrExtraction, PageRenderer, VisionTierOcr};
use super::preprocess;
use super::store::OcrStore;
use super::{OcrJob, OcrReview, OcrStatus, OcrTier};
use crate::config::OcrConfig;
use crate::canonical::sha256_hex;
use crate::errors::{ServiceError, ServiceResult};
use crate::ledger::{AppendRequest, AuditSink};

const PAGE_BREAK: &str = "\n\n--- Page Break ---\n\n";
const LOW_CONFIDENCE_WORD_LIMIT: i64 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct OcrRequest {
    pub tenant_id: String,
    /// Base64-encoded document bytes.
    pub document_data: String,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub force_tier: Option<OcrTier>,
    /// Overrides the fast-tier acceptance threshold for this request.
    #[serde(default)]
    pub confidence_threshold: Option<f64>,
    #[serde(default)]
    pub extract_fields: Option<Vec<String>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub job: OcrJob,
    /// True when the result was served from the content-hash cache.
    pub cached: bool,
}

struct PageResult {
    text: String,
    confidence: f64,
    tier: OcrTier,
    fast_confidence: Option<f64>,
    vision_confidence: Option<f64>,
    needs_review: bool,
    low_confidence_words: i64,
}

pub struct OcrPipeline {
    fast: Arc<dyn FastTierOcr>,
    vision: Option<Arc<dyn VisionTierOcr>>,
    renderer: Option<Arc<dyn PageRenderer>>,
    store: Arc<OcrStore>,
    audit: Arc<dyn AuditSink>,
    config: OcrConfig,
    review_tx: mpsc::Sender<String>,
    review_rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
}

impl OcrPipeline {
    pub fn new(
        fast: Arc<dyn FastTierOcr>,
        vision: Option<Arc<dyn VisionTierOcr>>,
        renderer: Option<Arc<dyn PageRenderer>>,
        store: Arc<OcrStore>,
        audit: Arc<dyn AuditSink>,
        config: OcrConfig,
    ) -> Self {
        let (review_tx, review_rx) = mpsc::channel(config.review_queue_depth.max(1));
        OcrPipeline {
            fast,
            vision,
            renderer,
            store,
            audit,
            config,
            review_tx,
            review_rx: tokio::sync::Mutex::new(review_rx),
        }
    }

    pub fn store(&self) -> &Arc<OcrStore> {
        &self.store
    }

    /// Reviewer polling: next queued job id, if any.
    pub async fn poll_review_queue(&self) -> Option<String> {
        self.review_rx.lock().await.try_recv().ok()
    }

    /// First 4 bytes `%PDF`, or a declared pdf content type.
    fn is_pdf(document_type: Option<&str>, bytes: &[u8]) -> bool {
        document_type.map_or(false, |t| t.to_lowercase().contains("pdf"))
            || bytes.len() >= 4 && &bytes[..4] == b"%PDF"
    }

    fn decode_pages(&self, bytes: &[u8], document_type: Option<&str>) -> ServiceResult<Vec<GrayImage>> {
        if Self::is_pdf(document_type, bytes) {
            let renderer = self.renderer.as_ref().ok_or_else(|| {
                ServiceError::InvalidInput("PDF input requires a configured page renderer".into())
            })?;
            renderer.render_pdf(bytes)
        } else {
            let image = image::load_from_memory(bytes)
                .map_err(|e| ServiceError::InvalidInput(format!("unreadable image: {}", e)))?;
            Ok(vec![image.to_luma8()])
        }
    }

    /// Process one document end to end.
    pub async fn process(&self, request: &OcrRequest) -> ServiceResult<OcrOutcome> {
        if request.tenant_id.is_empty() {
            return Err(ServiceError::InvalidInput(
                "tenant_id must not be empty".to_string(),
            ));
        }
        if matches!(request.force_tier, Some(OcrTier::HumanReview)) {
            return Err(ServiceError::InvalidInput(
                "human_review cannot be forced; submit a review instead".to_string(),
            ));
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&request.document_data)
            .map_err(|e| ServiceError::InvalidInput(format!("invalid base64 document: {}", e)))?;
        let document_hash = sha256_hex(&bytes);
        let started = Instant::now();

        // Cache first; a hit never reprocesses.
        if let Some(entry) = self.store.cache_get(&document_hash)? {
            let now = Utc::now();
            let job = OcrJob {
                id: Uuid::new_v4().to_string(),
                tenant_id: request.tenant_id.clone(),
                document_hash,
                status: OcrStatus::Completed,
                tier_used: Some(entry.tier_used),
                confidence: Some(entry.confidence),
                extracted_text: Some(entry.extracted_text),
                extracted_fields: Some(entry.extracted_fields),
                warnings: Value::Object(Map::new()),
                error: None,
                page_count: Some(entry.page_count),
                processing_time_ms: Some(started.elapsed().as_millis() as i64),
                fast_confidence: None,
                vision_confidence: None,
                user_id: request.user_id.clone(),
                correlation_id: request.correlation_id.clone(),
                created_at: now,
                updated_at: now,
            };
            self.store.upsert_job(&job)?;
            return Ok(OcrOutcome { job, cached: true });
        }

        let now = Utc::now();
        let mut job = OcrJob {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id.clone(),
            document_hash: document_hash.clone(),
            status: OcrStatus::Pending,
            tier_used: None,
            confidence: None,
            extracted_text: None,
            extracted_fields: None,
            warnings: Value::Object(Map::new()),
            error: None,
            page_count: None,
            processing_time_ms: None,
            fast_confidence: None,
            vision_confidence: None,
            user_id: request.user_id.clone(),
            correlation_id: request.correlation_id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.upsert_job(&job)?;

        match self.run_pipeline(request, &bytes, &mut job).await {
            Ok(()) => {}
            Err(e) => {
                job.status = OcrStatus::Failed;
                job.error = Some(e.to_string());
                job.processing_time_ms = Some(started.elapsed().as_millis() as i64);
                job.updated_at = Utc::now();
                self.store.upsert_job(&job)?;
                self.audit_event(&job, "ocr.failed").await;
                return Ok(OcrOutcome { job, cached: false });
            }
        }

        job.processing_time_ms = Some(started.elapsed().as_millis() as i64);
        job.updated_at = Utc::now();
        self.store.upsert_job(&job)?;

        // Every non-failed run writes the cache.
        self.store.cache_put(
            &document_hash,
            job.extracted_text.as_deref().unwrap_or(""),
            job.extracted_fields.as_ref().unwrap_or(&Value::Null),
            job.confidence.unwrap_or(0.0),
            job.tier_used.unwrap_or(OcrTier::Tesseract),
            job.page_count.unwrap_or(0),
            job.processing_time_ms.unwrap_or(0),
        )?;

        if job.status == OcrStatus::AwaitingReview {
            // Queue-full is tolerated; the persisted status drives reviewer
            // polling either way.
            if self.review_tx.try_send(job.id.clone()).is_err() {
                log::warn!("review queue full; job {} remains awaiting_review", job.id);
            }
            self.audit_event(&job, "ocr.awaiting_review").await;
        } else {
            self.audit_event(&job, "ocr.completed").await;
        }

        Ok(OcrOutcome { job, cached: false })
    }

    async fn run_pipeline(
        &self,
        request: &OcrRequest,
        bytes: &[u8],
        job: &mut OcrJob,
    ) -> ServiceResult<()> {
        let pages = self.decode_pages(bytes, request.document_type.as_deref())?;
        let accept_threshold = request
            .confidence_threshold
            .unwrap_or(self.config.fast_threshold);
        let extract_fields = request.extract_fields.as_deref();

        let mut warnings = Map::new();
        let mut texts = Vec::with_capacity(pages.len());
        let mut final_confidence = 0.0f64;
        let mut any_vision = false;
        let mut needs_review = false;

        job.page_count = Some(pages.len() as i64);

        for (page_num, page) in pages.iter().enumerate() {
            let page_num = page_num + 1;
            log::info!("processing page {}/{}", page_num, pages.len());
            let prepared = preprocess::prepare(page);

            let result = match request.force_tier {
                Some(OcrTier::Tesseract) => {
                    job.status = OcrStatus::ProcessingFast;
                    let ext = self.fast.extract(&prepared).await?;
                    Self::page_from_fast(ext)
                }
                Some(OcrTier::AiVision) => {
                    job.status = OcrStatus::ProcessingVision;
                    let ext = self.vision_extract(&prepared, extract_fields).await?;
                    Self::page_from_vision(ext, None)
                }
                _ => self.auto_tier(job, &prepared, accept_threshold, extract_fields).await?,
            };

            if result.low_confidence_words > LOW_CONFIDENCE_WORD_LIMIT {
                warnings.insert(
                    format!("page_{}", page_num),
                    Value::String("High number of low-confidence words detected".into()),
                );
            }
            let mut confidence = result.confidence;
            if result.text.trim().is_empty() {
                warnings.insert(
                    format!("page_{}_empty", page_num),
                    Value::String("Empty page text extracted".into()),
                );
                confidence = 0.0;
            }

            final_confidence = final_confidence.max(confidence);
            any_vision |= result.tier == OcrTier::AiVision;
            needs_review |= result.needs_review;
            if let Some(fast) = result.fast_confidence {
                job.fast_confidence = Some(job.fast_confidence.unwrap_or(0.0).max(fast));
            }
            if let Some(vision) = result.vision_confidence {
                job.vision_confidence = Some(job.vision_confidence.unwrap_or(0.0).max(vision));
            }
            texts.push(result.text);
        }

        job.extracted_text = Some(texts.join(PAGE_BREAK));
        job.confidence = Some(final_confidence);
        job.tier_used = Some(if any_vision {
            OcrTier::AiVision
        } else {
            OcrTier::Tesseract
        });
        if let Some(fields) = extract_fields {
            // Field extraction is the vision tier's concern; record what was
            // asked for so reviewers see the expectation.
            job.extracted_fields = Some(Value::Object(
                fields
                    .iter()
                    .map(|f| (f.clone(), Value::Null))
                    .collect::<Map<_, _>>(),
            ));
        }

        if needs_review || final_confidence < self.config.review_threshold {
            warnings.insert(
                "low_confidence".into(),
                Value::String(format!(
                    "Confidence {:.1}% below threshold {:.1}%",
                    final_confidence, self.config.review_threshold
                )),
            );
            job.status = OcrStatus::AwaitingReview;
        } else {
            job.status = OcrStatus::Completed;
        }
        job.warnings = Value::Object(warnings);
        Ok(())
    }

    fn page_from_fast(ext: OcrExtraction) -> PageResult {
        PageResult {
            low_confidence_words: ext.low_confidence_words(),
            fast_confidence: Some(ext.confidence),
            vision_confidence: None,
            confidence: ext.confidence,
            tier: OcrTier::Tesseract,
            needs_review: false,
            text: ext.text,
        }
    }

    fn page_from_vision(ext: OcrExtraction, fast_confidence: Option<f64>) -> PageResult {
        PageResult {
            low_confidence_words: ext.low_confidence_words(),
            fast_confidence,
            vision_confidence: Some(ext.confidence),
            confidence: ext.confidence,
            tier: OcrTier::AiVision,
            needs_review: false,
            text: ext.text,
        }
    }

    async fn vision_extract(
        &self,
        page: &GrayImage,
        extract_fields: Option<&[String]>,
    ) -> ServiceResult<OcrExtraction> {
        let vision = self.vision.as_ref().ok_or_else(|| {
            ServiceError::UpstreamUnavailable("vision tier not configured".into())
        })?;
        vision.extract(page, extract_fields).await
    }

    /// Fast first; escalate on low confidence or fast failure. A vision
    /// failure with a prior fast result keeps the fast result but flags the
    /// page for review.
    async fn auto_tier(
        &self,
        job: &mut OcrJob,
        page: &GrayImage,
        accept_threshold: f64,
        extract_fields: Option<&[String]>,
    ) -> ServiceResult<PageResult> {
        job.status = OcrStatus::ProcessingFast;
        let fast_result = match self.fast.extract(page).await {
            Ok(ext) => {
                if ext.confidence >= accept_threshold {
                    log::info!("fast tier accepted with {:.1}% confidence", ext.confidence);
                    return Ok(Self::page_from_fast(ext));
                }
                log::info!(
                    "fast confidence {:.1}% below threshold {:.1}%, escalating",
                    ext.confidence,
                    accept_threshold
                );
                Some(ext)
            }
            Err(e) => {
                log::warn!("fast tier failed, escalating: {}", e);
                None
            }
        };

        job.status = OcrStatus::ProcessingVision;
        match self.vision_extract(page, extract_fields).await {
            Ok(ext) => {
                log::info!("vision tier completed with {:.1}% confidence", ext.confidence);
                Ok(Self::page_from_vision(
                    ext,
                    fast_result.map(|f| f.confidence),
                ))
            }
            Err(e) => match fast_result {
                Some(fast) => {
                    log::warn!("vision tier failed, keeping fast result: {}", e);
                    let mut result = Self::page_from_fast(fast);
                    result.needs_review = true;
                    Ok(result)
                }
                None => Err(ServiceError::UpstreamUnavailable(format!(
                    "both OCR tiers failed: {}",
                    e
                ))),
            },
        }
    }

    /// A reviewer's corrections complete the job at full confidence.
    pub async fn submit_review(
        &self,
        job_id: &str,
        reviewer_id: &str,
        corrected_text: Option<String>,
        corrected_fields: Option<Value>,
        review_notes: Option<String>,
    ) -> ServiceResult<OcrReview> {
        let mut job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("OCR job {} not found", job_id)))?;

        let review = OcrReview {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            reviewer_id: reviewer_id.to_string(),
            reviewed_at: Utc::now(),
            corrected_text: corrected_text.clone(),
            corrected_fields: corrected_fields.clone(),
            review_notes,
            confidence_after_review: 100.0,
        };
        self.store.insert_review(&review)?;

        if let Some(text) = corrected_text {
            job.extracted_text = Some(text);
        }
        if let Some(fields) = corrected_fields {
            job.extracted_fields = Some(fields);
        }
        job.status = OcrStatus::Completed;
        job.tier_used = Some(OcrTier::HumanReview);
        job.confidence = Some(100.0);
        job.updated_at = Utc::now();
        self.store.upsert_job(&job)?;

        self.audit_event(&job, "ocr.review_submitted").await;
        Ok(review)
    }

    async fn audit_event(&self, job: &OcrJob, event_type: &str) {
        let mut event = AppendRequest::new(
            job.tenant_id.clone(),
            event_type,
            serde_json::json!({
                "job_id": job.id,
                "document_hash": job.document_hash,
                "tier_used": job.tier_used,
                "confidence": job.confidence,
            }),
        );
        if let Some(user_id) = &job.user_id {
            event = event.with_user(user_id.clone());
        }
        if let Some(correlation_id) = &job.correlation_id {
            event = event.with_correlation(correlation_id.clone());
        }
        if let Err(e) = self.audit.record(event).await {
            log::warn!("audit append for OCR job {} failed: {}", job.id, e);
        }
    }
}
