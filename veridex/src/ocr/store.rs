//! SQLite persistence for OCR jobs, reviews, and the result cache.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use super::{OcrCacheEntry, OcrJob, OcrReview, OcrStatus, OcrTier};
use crate::errors::{ServiceError, ServiceResult};

struct DbConn(Mutex<Connection>);

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbConn(<sqlite>)")
    }
}

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS ocr_jobs (
    id                 TEXT PRIMARY KEY,
    tenant_id          TEXT NOT NULL,
    document_hash      TEXT NOT NULL,
    status             TEXT NOT NULL,
    tier_used          TEXT,
    confidence         REAL,
    extracted_text     TEXT,
    extracted_fields   TEXT,
    warnings           TEXT NOT NULL,
    error              TEXT,
    page_count         INTEGER,
    processing_time_ms INTEGER,
    fast_confidence    REAL,
    vision_confidence  REAL,
    user_id            TEXT,
    correlation_id     TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ocr_jobs_tenant_status ON ocr_jobs(tenant_id, status);
CREATE INDEX IF NOT EXISTS idx_ocr_jobs_hash          ON ocr_jobs(document_hash);

CREATE TABLE IF NOT EXISTS ocr_reviews (
    id                      TEXT PRIMARY KEY,
    job_id                  TEXT NOT NULL,
    reviewer_id             TEXT NOT NULL,
    reviewed_at             TEXT NOT NULL,
    corrected_text          TEXT,
    corrected_fields        TEXT,
    review_notes            TEXT,
    confidence_after_review REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ocr_reviews_job ON ocr_reviews(job_id);

CREATE TABLE IF NOT EXISTS ocr_cache (
    document_hash      TEXT PRIMARY KEY,
    extracted_text     TEXT NOT NULL,
    extracted_fields   TEXT NOT NULL,
    confidence         REAL NOT NULL,
    tier_used          TEXT NOT NULL,
    page_count         INTEGER NOT NULL,
    processing_time_ms INTEGER NOT NULL,
    created_at         TEXT NOT NULL,
    last_accessed_at   TEXT NOT NULL,
    hit_count          INTEGER NOT NULL DEFAULT 0
);
";

fn parse_ts(s: String) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

#[derive(Debug)]
pub struct OcrStore {
    conn: DbConn,
}

impl OcrStore {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Internal(format!("failed to create ocr db dir: {}", e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ServiceError::Internal(format!("failed to open ocr db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServiceError::Internal(format!("failed to open ocr db: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(CREATE_SCHEMA_SQL).map_err(|e| {
            ServiceError::Internal(format!("failed to initialise ocr schema: {}", e))
        })?;
        Ok(OcrStore {
            conn: DbConn(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .0
            .lock()
            .map_err(|e| ServiceError::Internal(format!("ocr lock poisoned: {}", e)))
    }

    pub fn upsert_job(&self, job: &OcrJob) -> ServiceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ocr_jobs \
             (id, tenant_id, document_hash, status, tier_used, confidence, extracted_text, \
              extracted_fields, warnings, error, page_count, processing_time_ms, \
              fast_confidence, vision_confidence, user_id, correlation_id, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18) \
             ON CONFLICT(id) DO UPDATE SET \
               status = excluded.status, tier_used = excluded.tier_used, \
               confidence = excluded.confidence, extracted_text = excluded.extracted_text, \
               extracted_fields = excluded.extracted_fields, warnings = excluded.warnings, \
               error = excluded.error, page_count = excluded.page_count, \
               processing_time_ms = excluded.processing_time_ms, \
               fast_confidence = excluded.fast_confidence, \
               vision_confidence = excluded.vision_confidence, \
               updated_at = excluded.updated_at",
            params![
                job.id,
                job.tenant_id,
                job.document_hash,
                job.status.as_str(),
                job.tier_used.map(|t| t.as_str()),
                job.confidence,
                job.extracted_text,
                job.extracted_fields.as_ref().map(|f| f.to_string()),
                job.warnings.to_string(),
                job.error,
                job.page_count,
                job.processing_time_ms,
                job.fast_confidence,
                job.vision_confidence,
                job.user_id,
                job.correlation_id,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<OcrJob> {
        let status: String = row.get(3)?;
        let tier: Option<String> = row.get(4)?;
        let fields: Option<String> = row.get(7)?;
        let warnings: String = row.get(8)?;
        Ok(OcrJob {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            document_hash: row.get(2)?,
            status: OcrStatus::parse(&status).unwrap_or(OcrStatus::Failed),
            tier_used: tier.as_deref().and_then(OcrTier::parse),
            confidence: row.get(5)?,
            extracted_text: row.get(6)?,
            extracted_fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
            warnings: serde_json::from_str(&warnings).unwrap_or(Value::Null),
            error: row.get(9)?,
            page_count: row.get(10)?,
            processing_time_ms: row.get(11)?,
            fast_confidence: row.get(12)?,
            vision_confidence: row.get(13)?,
            user_id: row.get(14)?,
            correlation_id: row.get(15)?,
            created_at: parse_ts(row.get::<_, String>(16)?),
            updated_at: parse_ts(row.get::<_, String>(17)?),
        })
    }

    pub fn get_job(&self, job_id: &str) -> ServiceResult<Option<OcrJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                "SELECT id, tenant_id, document_hash, status, tier_used, confidence, \
                 extracted_text, extracted_fields, warnings, error, page_count, \
                 processing_time_ms, fast_confidence, vision_confidence, user_id, \
                 correlation_id, created_at, updated_at \
                 FROM ocr_jobs WHERE id = ?1",
                [job_id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn jobs_by_status(
        &self,
        tenant_id: &str,
        status: OcrStatus,
    ) -> ServiceResult<Vec<OcrJob>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, document_hash, status, tier_used, confidence, \
             extracted_text, extracted_fields, warnings, error, page_count, \
             processing_time_ms, fast_confidence, vision_confidence, user_id, \
             correlation_id, created_at, updated_at \
             FROM ocr_jobs WHERE tenant_id = ?1 AND status = ?2 ORDER BY created_at ASC",
        )?;
        let jobs = stmt
            .query_map(params![tenant_id, status.as_str()], Self::row_to_job)
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        Ok(jobs)
    }

    /// Cache lookup; a hit bumps `hit_count` and `last_accessed_at`.
    pub fn cache_get(&self, document_hash: &str) -> ServiceResult<Option<OcrCacheEntry>> {
        let conn = self.lock()?;
        let entry = conn
            .query_row(
                "SELECT document_hash, extracted_text, extracted_fields, confidence, tier_used, \
                 page_count, processing_time_ms, created_at, last_accessed_at, hit_count \
                 FROM ocr_cache WHERE document_hash = ?1",
                [document_hash],
                |row| {
                    let fields: String = row.get(2)?;
                    let tier: String = row.get(4)?;
                    Ok(OcrCacheEntry {
                        document_hash: row.get(0)?,
                        extracted_text: row.get(1)?,
                        extracted_fields: serde_json::from_str(&fields).unwrap_or(Value::Null),
                        confidence: row.get(3)?,
                        tier_used: OcrTier::parse(&tier).unwrap_or(OcrTier::Tesseract),
                        page_count: row.get(5)?,
                        processing_time_ms: row.get(6)?,
                        created_at: parse_ts(row.get::<_, String>(7)?),
                        last_accessed_at: parse_ts(row.get::<_, String>(8)?),
                        hit_count: row.get(9)?,
                    })
                },
            )
            .optional()?;

        if let Some(ref entry) = entry {
            conn.execute(
                "UPDATE ocr_cache SET hit_count = hit_count + 1, last_accessed_at = ?2 \
                 WHERE document_hash = ?1",
                params![entry.document_hash, Utc::now().to_rfc3339()],
            )?;
        }
        Ok(entry)
    }

    /// Idempotent by primary key; re-processing the same document overwrites
    /// the prior entry.
    pub fn cache_put(
        &self,
        document_hash: &str,
        extracted_text: &str,
        extracted_fields: &Value,
        confidence: f64,
        tier_used: OcrTier,
        page_count: i64,
        processing_time_ms: i64,
    ) -> ServiceResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ocr_cache \
             (document_hash, extracted_text, extracted_fields, confidence, tier_used, \
              page_count, processing_time_ms, created_at, last_accessed_at, hit_count) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?8,0) \
             ON CONFLICT(document_hash) DO UPDATE SET \
               extracted_text = excluded.extracted_text, \
               extracted_fields = excluded.extracted_fields, \
               confidence = excluded.confidence, tier_used = excluded.tier_used, \
               page_count = excluded.page_count, \
               processing_time_ms = excluded.processing_time_ms, \
               last_accessed_at = excluded.last_accessed_at",
            params![
                document_hash,
                extracted_text,
                extracted_fields.to_string(),
                confidence,
                tier_used.as_str(),
                page_count,
                processing_time_ms,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn insert_review(&self, review: &OcrReview) -> ServiceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO ocr_reviews \
             (id, job_id, reviewer_id, reviewed_at, corrected_text, corrected_fields, \
              review_notes, confidence_after_review) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                review.id,
                review.job_id,
                review.reviewer_id,
                review.reviewed_at.to_rfc3339(),
                review.corrected_text,
                review.corrected_fields.as_ref().map(|f| f.to_string()),
                review.review_notes,
                review.confidence_after_review,
            ],
        )?;
        Ok(())
    }

    pub fn reviews_for_job(&self, job_id: &str) -> ServiceResult<Vec<OcrReview>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, reviewer_id, reviewed_at, corrected_text, corrected_fields, \
             review_notes, confidence_after_review \
             FROM ocr_reviews WHERE job_id = ?1 ORDER BY reviewed_at ASC",
        )?;
        let reviews = stmt
            .query_map([job_id], |row| {
                let fields: Option<String> = row.get(5)?;
                Ok(OcrReview {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    reviewer_id: row.get(2)?,
                    reviewed_at: parse_ts(row.get::<_, String>(3)?),
                    corrected_text: row.get(4)?,
                    corrected_fields: fields.and_then(|f| serde_json::from_str(&f).ok()),
                    review_notes: row.get(6)?,
                    confidence_after_review: row.get(7)?,
                })
            })
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        Ok(reviews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn job(id: &str, status: OcrStatus) -> OcrJob {
        OcrJob {
            id: id.into(),
            tenant_id: "t1".into(),
            document_hash: "h".repeat(64),
            status,
            tier_used: None,
            confidence: None,
            extracted_text: None,
            extracted_fields: None,
            warnings: json!({}),
            error: None,
            page_count: None,
            processing_time_ms: None,
            fast_confidence: None,
            vision_confidence: None,
            user_id: None,
            correlation_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_job_upsert_roundtrip() {
        let store = OcrStore::open_in_memory().unwrap();
        let mut j = job("j1", OcrStatus::Pending);
        store.upsert_job(&j).unwrap();

        j.status = OcrStatus::Completed;
        j.confidence = Some(91.5);
        j.tier_used = Some(OcrTier::AiVision);
        j.extracted_text = Some("deed of trust".into());
        store.upsert_job(&j).unwrap();

        let loaded = store.get_job("j1").unwrap().unwrap();
        assert_eq!(loaded.status, OcrStatus::Completed);
        assert_eq!(loaded.confidence, Some(91.5));
        assert_eq!(loaded.tier_used, Some(OcrTier::AiVision));
        assert!(store.get_job("missing").unwrap().is_none());
    }

    #[test]
    fn test_jobs_by_status() {
        let store = OcrStore::open_in_memory().unwrap();
        store.upsert_job(&job("j1", OcrStatus::AwaitingReview)).unwrap();
        store.upsert_job(&job("j2", OcrStatus::Completed)).unwrap();
        let awaiting = store.jobs_by_status("t1", OcrStatus::AwaitingReview).unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].id, "j1");
    }

    #[test]
    fn test_cache_hit_counter() {
        let store = OcrStore::open_in_memory().unwrap();
        let hash = "a".repeat(64);
        store
            .cache_put(&hash, "text", &json!({}), 92.0, OcrTier::Tesseract, 1, 40)
            .unwrap();

        let first = store.cache_get(&hash).unwrap().unwrap();
        assert_eq!(first.hit_count, 0);
        let second = store.cache_get(&hash).unwrap().unwrap();
        assert_eq!(second.hit_count, 1);
        assert!(store.cache_get(&"b".repeat(64)).unwrap().is_none());
    }

    #[test]
    fn test_review_insert_and_list() {
        let store = OcrStore::open_in_memory().unwrap();
        let review = OcrReview {
            id: Uuid::new_v4().to_string(),
            job_id: "j1".into(),
            reviewer_id: "rev-1".into(),
            reviewed_at: Utc::now(),
            corrected_text: Some("corrected".into()),
            corrected_fields: Some(json!({"grantor": "Jane"})),
            review_notes: None,
            confidence_after_review: 100.0,
        };
        store.insert_review(&review).unwrap();
        let reviews = store.reviews_for_job("j1").unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].confidence_after_review, 100.0);
    }
}
