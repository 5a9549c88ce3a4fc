//! Append-only hash-chained audit ledger.
//!
//! Tenant-partitioned event log with per-tenant chain linkage: every event
//! binds `sha256(canonical_json(event_data))` to the previous event's chain
//! hash, so any in-place mutation breaks verification from that offset on.
//! Appends are serialized per tenant; different tenants proceed
//! independently. Query and export never mutate.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::canonical::{hash_value, sha256_hex};
use crate::errors::{ServiceError, ServiceResult};

pub mod export;
pub mod store;

pub use store::LedgerStore;

/// Canonical previous_hash for the first event of a tenant.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Maximum page size accepted by [`LedgerService::query`].
pub const MAX_QUERY_LIMIT: i64 = 1000;

/// `sha256(canonical_json(event_data))`.
pub fn compute_content_hash(event_data: &Value) -> ServiceResult<String> {
    hash_value(event_data)
}

/// `sha256(content_hash || previous_hash)` over the two 64-hex-char strings.
pub fn compute_chain_hash(content_hash: &str, previous_hash: &str) -> String {
    sha256_hex(format!("{}{}", content_hash, previous_hash))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEvent {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub content_hash: String,
    pub previous_hash: String,
    pub chain_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub tenant_id: String,
    pub event_type: String,
    pub event_data: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl AppendRequest {
    pub fn new(tenant_id: impl Into<String>, event_type: impl Into<String>, data: Value) -> Self {
        AppendRequest {
            tenant_id: tenant_id.into(),
            event_type: event_type.into(),
            event_data: data,
            user_id: None,
            correlation_id: None,
            description: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub id: String,
    pub chain_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub tenant_id: String,
    pub event_type: Option<String>,
    pub correlation_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<LedgerEvent>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Outcome of a whole-chain verification walk.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VerificationReport {
    pub ok: bool,
    pub checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_bad_offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerificationReport {
    fn ok(checked: usize) -> Self {
        VerificationReport {
            ok: true,
            checked,
            first_bad_offset: None,
            reason: None,
        }
    }

    fn bad(offset: usize, reason: String) -> Self {
        VerificationReport {
            ok: false,
            checked: offset,
            first_bad_offset: Some(offset),
            reason: Some(reason),
        }
    }
}

/// Sink other subsystems use to append audit events without owning the
/// ledger. The workflow executor and the OCR review path both record through
/// this seam.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, request: AppendRequest) -> ServiceResult<AppendReceipt>;
}

/// Audit sink that drops events; for tests and ledger-less deployments.
pub struct NullAuditSink;

#[async_trait::async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, request: AppendRequest) -> ServiceResult<AppendReceipt> {
        log::debug!(
            "[ledger] dropping audit event {} for tenant {}",
            request.event_type,
            request.tenant_id
        );
        Ok(AppendReceipt {
            id: Uuid::new_v4().to_string(),
            chain_hash: GENESIS_HASH.to_string(),
            created_at: Utc::now(),
        })
    }
}

/// Tenant-partitioned ledger service over a [`LedgerStore`].
pub struct LedgerService {
    store: LedgerStore,
    // Per-tenant append serialization; the store additionally rejects a stale
    // previous_hash inside its transaction.
    tenant_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl LedgerService {
    pub fn new(store: LedgerStore) -> Self {
        LedgerService {
            store,
            tenant_locks: DashMap::new(),
        }
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.tenant_locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Append one event to the tenant's chain. Never partially succeeds.
    pub async fn append(&self, request: AppendRequest) -> ServiceResult<AppendReceipt> {
        if request.tenant_id.is_empty() {
            return Err(ServiceError::InvalidInput(
                "tenant_id must not be empty".to_string(),
            ));
        }
        if request.event_type.is_empty() {
            return Err(ServiceError::InvalidInput(
                "event_type must not be empty".to_string(),
            ));
        }

        let lock = self.tenant_lock(&request.tenant_id);
        let _guard = lock.lock().await;

        let previous_hash = self
            .store
            .latest_chain_hash(&request.tenant_id)?
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let content_hash = compute_content_hash(&request.event_data)?;
        let chain_hash = compute_chain_hash(&content_hash, &previous_hash);

        let event = LedgerEvent {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id,
            event_type: request.event_type,
            event_data: request.event_data,
            content_hash,
            previous_hash,
            chain_hash,
            created_at: Utc::now(),
            user_id: request.user_id,
            correlation_id: request.correlation_id,
            description: request.description,
        };

        self.store.append_event(&event)?;

        log::debug!(
            "[ledger] appended {} for tenant {} (chain {})",
            event.event_type,
            event.tenant_id,
            &event.chain_hash[..8]
        );

        Ok(AppendReceipt {
            id: event.id,
            chain_hash: event.chain_hash,
            created_at: event.created_at,
        })
    }

    /// Paginated query, newest first. Limit must be in `[1, 1000]`, offset
    /// non-negative. A tenant with no events yields an empty page, total 0.
    pub fn query(&self, query: &EventQuery) -> ServiceResult<EventPage> {
        if query.tenant_id.is_empty() {
            return Err(ServiceError::InvalidInput(
                "tenant_id must not be empty".to_string(),
            ));
        }
        if query.limit < 1 || query.limit > MAX_QUERY_LIMIT {
            return Err(ServiceError::InvalidInput(format!(
                "limit must be between 1 and {}",
                MAX_QUERY_LIMIT
            )));
        }
        if query.offset < 0 {
            return Err(ServiceError::InvalidInput(
                "offset must not be negative".to_string(),
            ));
        }

        let events = self.store.query_events(query)?;
        let total = self.store.count_events(
            &query.tenant_id,
            query.event_type.as_deref(),
            query.correlation_id.as_deref(),
        )?;
        Ok(EventPage {
            events,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    /// Recompute every hash of a tenant's chain in creation order.
    pub fn verify_chain(&self, tenant_id: &str) -> ServiceResult<VerificationReport> {
        let events = self.store.events_ascending(tenant_id, None)?;
        let mut previous = GENESIS_HASH.to_string();
        for (offset, event) in events.iter().enumerate() {
            let content_hash = compute_content_hash(&event.event_data)?;
            if content_hash != event.content_hash {
                return Ok(VerificationReport::bad(
                    offset,
                    format!("content hash mismatch at offset {}", offset),
                ));
            }
            if event.previous_hash != previous {
                return Ok(VerificationReport::bad(
                    offset,
                    format!("broken chain linkage at offset {}", offset),
                ));
            }
            let chain_hash = compute_chain_hash(&content_hash, &previous);
            if chain_hash != event.chain_hash {
                return Ok(VerificationReport::bad(
                    offset,
                    format!("chain hash mismatch at offset {}", offset),
                ));
            }
            previous = event.chain_hash.clone();
        }
        Ok(VerificationReport::ok(events.len()))
    }

    /// CSV export, ascending creation order, frozen column set.
    pub fn export_csv(
        &self,
        tenant_id: &str,
        event_type: Option<&str>,
    ) -> ServiceResult<String> {
        if tenant_id.is_empty() {
            return Err(ServiceError::InvalidInput(
                "tenant_id must not be empty".to_string(),
            ));
        }
        let events = self.store.events_ascending(tenant_id, event_type)?;
        export::to_csv(&events)
    }
}

#[async_trait::async_trait]
impl AuditSink for LedgerService {
    async fn record(&self, request: AppendRequest) -> ServiceResult<AppendReceipt> {
        self.append(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> LedgerService {
        LedgerService::new(LedgerStore::open_in_memory().unwrap())
    }

    async fn append_n(service: &LedgerService, tenant: &str, n: usize) -> Vec<AppendReceipt> {
        let mut receipts = Vec::new();
        for i in 0..n {
            let receipt = service
                .append(AppendRequest::new(
                    tenant,
                    "validation.completed",
                    json!({"seq": i}),
                ))
                .await
                .unwrap();
            receipts.push(receipt);
        }
        receipts
    }

    #[tokio::test]
    async fn test_first_event_links_to_genesis() {
        let service = service();
        let receipt = service
            .append(AppendRequest::new("t1", "workflow.start", json!({"a": 1})))
            .await
            .unwrap();

        let page = service
            .query(&EventQuery {
                tenant_id: "t1".into(),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].previous_hash, GENESIS_HASH);
        assert_eq!(page.events[0].chain_hash, receipt.chain_hash);
    }

    #[tokio::test]
    async fn test_append_then_verify_ok() {
        let service = service();
        append_n(&service, "t1", 5).await;
        let report = service.verify_chain("t1").unwrap();
        assert!(report.ok);
        assert_eq!(report.checked, 5);
    }

    #[tokio::test]
    async fn test_tenants_chain_independently() {
        let service = service();
        append_n(&service, "t1", 3).await;
        append_n(&service, "t2", 2).await;

        let t2 = service.store.events_ascending("t2", None).unwrap();
        assert_eq!(t2[0].previous_hash, GENESIS_HASH);
        assert!(service.verify_chain("t1").unwrap().ok);
        assert!(service.verify_chain("t2").unwrap().ok);
    }

    #[tokio::test]
    async fn test_tamper_detected_at_offset() {
        let service = service();
        append_n(&service, "t1", 5).await;

        let third = service.store.events_ascending("t1", None).unwrap()[2].clone();
        service
            .store
            .overwrite_event_data(&third.id, &json!({"seq": 999}))
            .unwrap();

        let report = service.verify_chain("t1").unwrap();
        assert!(!report.ok);
        assert_eq!(report.first_bad_offset, Some(2));
    }

    #[tokio::test]
    async fn test_query_pagination_and_filters() {
        let service = service();
        append_n(&service, "t1", 4).await;
        service
            .append(
                AppendRequest::new("t1", "workflow.start", json!({"w": 1}))
                    .with_correlation("corr-9"),
            )
            .await
            .unwrap();

        let page = service
            .query(&EventQuery {
                tenant_id: "t1".into(),
                limit: 2,
                offset: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.events.len(), 2);
        // Newest first; offset 1 skips the workflow.start event.
        assert_eq!(page.events[0].event_data["seq"], 3);

        let filtered = service
            .query(&EventQuery {
                tenant_id: "t1".into(),
                event_type: Some("workflow.start".into()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(filtered.total, 1);

        let by_corr = service
            .query(&EventQuery {
                tenant_id: "t1".into(),
                correlation_id: Some("corr-9".into()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_corr.total, 1);
    }

    #[tokio::test]
    async fn test_query_limit_bounds() {
        let service = service();
        let bad_limits = [0, 1001, -5];
        for limit in bad_limits {
            let err = service
                .query(&EventQuery {
                    tenant_id: "t1".into(),
                    limit,
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidInput(_)));
        }
        let err = service
            .query(&EventQuery {
                tenant_id: "t1".into(),
                limit: 10,
                offset: -1,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_empty_tenant_is_empty_chain() {
        let service = service();
        let page = service
            .query(&EventQuery {
                tenant_id: "never-written".into(),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.total, 0);
        assert!(service.verify_chain("never-written").unwrap().ok);
    }

    #[tokio::test]
    async fn test_content_hash_key_order_independent() {
        let a = compute_content_hash(&json!({"a": 1, "b": 2})).unwrap();
        let b = compute_content_hash(&json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(a, b);
        assert_ne!(
            compute_chain_hash(&a, GENESIS_HASH),
            compute_chain_hash(GENESIS_HASH, &a)
        );
    }
}
