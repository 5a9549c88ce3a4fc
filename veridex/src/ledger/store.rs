//! SQLite persistence for ledger events.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{EventQuery, LedgerEvent};
use crate::errors::{ServiceError, ServiceResult};

/// Newtype wrapping `Connection` in a `Mutex` so the store is `Send + Sync`.
/// `rusqlite::Connection` is `Send` but not `Sync`.
struct DbConn(Mutex<Connection>);

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbConn(<sqlite>)")
    }
}

/// `seq` is the per-database monotonic insertion order; within a tenant it is
/// the chain order used by verification and export.
const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS ledger_events (
    seq            INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT    NOT NULL UNIQUE,
    tenant_id      TEXT    NOT NULL,
    event_type     TEXT    NOT NULL,
    event_data     TEXT    NOT NULL,
    content_hash   TEXT    NOT NULL,
    previous_hash  TEXT    NOT NULL,
    chain_hash     TEXT    NOT NULL UNIQUE,
    created_at     TEXT    NOT NULL,
    user_id        TEXT,
    correlation_id TEXT,
    description    TEXT
);
CREATE INDEX IF NOT EXISTS idx_ledger_tenant       ON ledger_events(tenant_id);
CREATE INDEX IF NOT EXISTS idx_ledger_tenant_type  ON ledger_events(tenant_id, event_type);
CREATE INDEX IF NOT EXISTS idx_ledger_correlation  ON ledger_events(correlation_id);
";

#[derive(Debug)]
pub struct LedgerStore {
    conn: DbConn,
}

impl LedgerStore {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Internal(format!("failed to create ledger db dir: {}", e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ServiceError::Internal(format!("failed to open ledger db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServiceError::Internal(format!("failed to open ledger db: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(CREATE_SCHEMA_SQL).map_err(|e| {
            ServiceError::Internal(format!("failed to initialise ledger schema: {}", e))
        })?;
        Ok(LedgerStore {
            conn: DbConn(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .0
            .lock()
            .map_err(|e| ServiceError::Internal(format!("ledger lock poisoned: {}", e)))
    }

    pub fn latest_chain_hash(&self, tenant_id: &str) -> ServiceResult<Option<String>> {
        let conn = self.lock()?;
        let hash = conn
            .query_row(
                "SELECT chain_hash FROM ledger_events WHERE tenant_id = ?1 \
                 ORDER BY seq DESC LIMIT 1",
                [tenant_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Insert one event, rejecting a stale `previous_hash` and any chain-hash
    /// collision with `Conflict`. The check and the insert share one
    /// transaction so a concurrent appender cannot interleave.
    pub fn append_event(&self, event: &LedgerEvent) -> ServiceResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let latest: Option<String> = tx
            .query_row(
                "SELECT chain_hash FROM ledger_events WHERE tenant_id = ?1 \
                 ORDER BY seq DESC LIMIT 1",
                [&event.tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        let expected = latest.unwrap_or_else(|| super::GENESIS_HASH.to_string());
        if event.previous_hash != expected {
            return Err(ServiceError::Conflict(format!(
                "stale previous_hash for tenant {}",
                event.tenant_id
            )));
        }

        let inserted = tx.execute(
            "INSERT INTO ledger_events \
             (id, tenant_id, event_type, event_data, content_hash, previous_hash, \
              chain_hash, created_at, user_id, correlation_id, description) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                event.id,
                event.tenant_id,
                event.event_type,
                event.event_data.to_string(),
                event.content_hash,
                event.previous_hash,
                event.chain_hash,
                event.created_at.to_rfc3339(),
                event.user_id,
                event.correlation_id,
                event.description,
            ],
        );
        match inserted {
            Ok(_) => {
                tx.commit()?;
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ServiceError::Conflict(
                    "chain hash already recorded".to_string(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<(LedgerEvent, String)> {
        Ok((
            LedgerEvent {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                event_type: row.get(2)?,
                event_data: serde_json::Value::Null,
                content_hash: row.get(4)?,
                previous_hash: row.get(5)?,
                chain_hash: row.get(6)?,
                created_at: row
                    .get::<_, String>(7)?
                    .parse()
                    .unwrap_or_else(|_| chrono::Utc::now()),
                user_id: row.get(8)?,
                correlation_id: row.get(9)?,
                description: row.get(10)?,
            },
            row.get::<_, String>(3)?,
        ))
    }

    fn collect_events(rows: Vec<(LedgerEvent, String)>) -> ServiceResult<Vec<LedgerEvent>> {
        rows.into_iter()
            .map(|(mut event, data_json)| {
                event.event_data = serde_json::from_str(&data_json)?;
                Ok(event)
            })
            .collect()
    }

    pub fn query_events(&self, query: &EventQuery) -> ServiceResult<Vec<LedgerEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, event_type, event_data, content_hash, previous_hash, \
             chain_hash, created_at, user_id, correlation_id, description \
             FROM ledger_events \
             WHERE tenant_id = ?1 \
               AND (?2 IS NULL OR event_type = ?2) \
               AND (?3 IS NULL OR correlation_id = ?3) \
             ORDER BY seq DESC LIMIT ?4 OFFSET ?5",
        )?;
        let rows = stmt
            .query_map(
                params![
                    query.tenant_id,
                    query.event_type,
                    query.correlation_id,
                    query.limit,
                    query.offset,
                ],
                Self::row_to_event,
            )
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        Self::collect_events(rows)
    }

    pub fn count_events(
        &self,
        tenant_id: &str,
        event_type: Option<&str>,
        correlation_id: Option<&str>,
    ) -> ServiceResult<i64> {
        let conn = self.lock()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM ledger_events \
             WHERE tenant_id = ?1 \
               AND (?2 IS NULL OR event_type = ?2) \
               AND (?3 IS NULL OR correlation_id = ?3)",
            params![tenant_id, event_type, correlation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// All of a tenant's events in chain (creation) order.
    pub fn events_ascending(
        &self,
        tenant_id: &str,
        event_type: Option<&str>,
    ) -> ServiceResult<Vec<LedgerEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, event_type, event_data, content_hash, previous_hash, \
             chain_hash, created_at, user_id, correlation_id, description \
             FROM ledger_events \
             WHERE tenant_id = ?1 AND (?2 IS NULL OR event_type = ?2) \
             ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![tenant_id, event_type], Self::row_to_event)
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        Self::collect_events(rows)
    }

    /// Overwrite stored event_data without recomputing hashes; only reachable
    /// from tamper-detection tests.
    #[cfg(test)]
    pub fn overwrite_event_data(
        &self,
        event_id: &str,
        data: &serde_json::Value,
    ) -> ServiceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE ledger_events SET event_data = ?1 WHERE id = ?2",
            params![data.to_string(), event_id],
        )?;
        Ok(())
    }
}
