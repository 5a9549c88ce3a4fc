//! CSV export of ledger events.
//!
//! Column order is frozen; `event_data` is deliberately not exported.

use super::LedgerEvent;
use crate::errors::{ServiceError, ServiceResult};

const COLUMNS: [&str; 10] = [
    "id",
    "tenant_id",
    "event_type",
    "created_at",
    "content_hash",
    "previous_hash",
    "chain_hash",
    "user_id",
    "correlation_id",
    "description",
];

pub fn to_csv(events: &[LedgerEvent]) -> ServiceResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(COLUMNS)
        .map_err(|e| ServiceError::Internal(format!("csv header write failed: {}", e)))?;

    for event in events {
        writer
            .write_record([
                event.id.as_str(),
                event.tenant_id.as_str(),
                event.event_type.as_str(),
                &event.created_at.to_rfc3339(),
                event.content_hash.as_str(),
                event.previous_hash.as_str(),
                event.chain_hash.as_str(),
                event.user_id.as_deref().unwrap_or(""),
                event.correlation_id.as_deref().unwrap_or(""),
                event.description.as_deref().unwrap_or(""),
            ])
            .map_err(|e| ServiceError::Internal(format!("csv row write failed: {}", e)))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ServiceError::Internal(format!("csv flush failed: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| ServiceError::Internal(format!("csv output not utf-8: {}", e)))
}
