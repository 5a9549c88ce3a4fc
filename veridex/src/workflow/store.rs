//! SQLite persistence for approval tasks and workflow execution records.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use super::approval::{ApprovalStore, ApprovalTask, ApproveOutcome, RejectOutcome, TaskStatus};
use super::{WorkflowExecutionRecord, WorkflowState};
use crate::errors::{ServiceError, ServiceResult};

struct DbConn(Mutex<Connection>);

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbConn(<sqlite>)")
    }
}

fn open_connection(path: &Path) -> ServiceResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ServiceError::Internal(format!("failed to create workflow db dir: {}", e))
        })?;
    }
    let conn = Connection::open(path)
        .map_err(|e| ServiceError::Internal(format!("failed to open workflow db: {}", e)))?;
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
    Ok(conn)
}

const APPROVAL_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS approval_tasks (
    task_id       TEXT PRIMARY KEY,
    workflow_id   TEXT NOT NULL,
    requester     TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    payload_hash  TEXT NOT NULL,
    status        TEXT NOT NULL,
    approved_by   TEXT,
    approved_at   TEXT,
    approval_data TEXT
);
CREATE INDEX IF NOT EXISTS idx_approval_workflow ON approval_tasks(workflow_id);
CREATE INDEX IF NOT EXISTS idx_approval_status   ON approval_tasks(status);
";

/// Durable approval task store; the approve/reject CAS is a conditional
/// UPDATE guarded on `status = 'pending'`.
#[derive(Debug)]
pub struct SqliteApprovalStore {
    conn: DbConn,
}

impl SqliteApprovalStore {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        Self::init(open_connection(path)?)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServiceError::Internal(format!("failed to open workflow db: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(APPROVAL_SCHEMA_SQL).map_err(|e| {
            ServiceError::Internal(format!("failed to initialise approval schema: {}", e))
        })?;
        Ok(SqliteApprovalStore {
            conn: DbConn(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .0
            .lock()
            .map_err(|e| ServiceError::Internal(format!("approval lock poisoned: {}", e)))
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalTask> {
        let status: String = row.get(5)?;
        let approval_data: Option<String> = row.get(8)?;
        Ok(ApprovalTask {
            task_id: row.get(0)?,
            workflow_id: row.get(1)?,
            requester: row.get(2)?,
            created_at: parse_ts(row.get::<_, String>(3)?),
            payload_hash: row.get(4)?,
            status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
            approved_by: row.get(6)?,
            approved_at: row.get::<_, Option<String>>(7)?.map(parse_ts),
            approval_data: approval_data.and_then(|d| serde_json::from_str(&d).ok()),
        })
    }

    fn fetch(conn: &Connection, task_id: &str) -> ServiceResult<Option<ApprovalTask>> {
        let task = conn
            .query_row(
                "SELECT task_id, workflow_id, requester, created_at, payload_hash, status, \
                 approved_by, approved_at, approval_data \
                 FROM approval_tasks WHERE task_id = ?1",
                [task_id],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

#[async_trait::async_trait]
impl ApprovalStore for SqliteApprovalStore {
    async fn insert(&self, task: ApprovalTask) -> ServiceResult<()> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO approval_tasks \
             (task_id, workflow_id, requester, created_at, payload_hash, status, \
              approved_by, approved_at, approval_data) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                task.task_id,
                task.workflow_id,
                task.requester,
                task.created_at.to_rfc3339(),
                task.payload_hash,
                task.status.as_str(),
                task.approved_by,
                task.approved_at.map(|t| t.to_rfc3339()),
                task.approval_data.as_ref().map(|d| d.to_string()),
            ],
        )?;
        if inserted == 0 {
            return Err(ServiceError::Conflict(format!(
                "approval task {} already exists",
                task.task_id
            )));
        }
        Ok(())
    }

    async fn get(&self, task_id: &str) -> ServiceResult<Option<ApprovalTask>> {
        let conn = self.lock()?;
        Self::fetch(&conn, task_id)
    }

    async fn find_by_workflow(&self, workflow_id: &str) -> ServiceResult<Option<ApprovalTask>> {
        let conn = self.lock()?;
        let task = conn
            .query_row(
                "SELECT task_id, workflow_id, requester, created_at, payload_hash, status, \
                 approved_by, approved_at, approval_data \
                 FROM approval_tasks WHERE workflow_id = ?1 ORDER BY created_at DESC LIMIT 1",
                [workflow_id],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    async fn approve(
        &self,
        task_id: &str,
        approved_by: &str,
        approval_data: Value,
    ) -> ServiceResult<ApproveOutcome> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE approval_tasks \
             SET status = 'approved', approved_by = ?2, approved_at = ?3, approval_data = ?4 \
             WHERE task_id = ?1 AND status = 'pending'",
            params![
                task_id,
                approved_by,
                Utc::now().to_rfc3339(),
                approval_data.to_string(),
            ],
        )?;
        let task = Self::fetch(&conn, task_id)?
            .ok_or_else(|| ServiceError::NotFound("Approval task not found".into()))?;
        if updated == 1 {
            Ok(ApproveOutcome::Approved(task))
        } else {
            match task.status {
                TaskStatus::Rejected => Ok(ApproveOutcome::Rejected(task)),
                _ => Ok(ApproveOutcome::AlreadyApproved(task)),
            }
        }
    }

    async fn reject(&self, task_id: &str, rejected_by: &str) -> ServiceResult<RejectOutcome> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE approval_tasks \
             SET status = 'rejected', approved_by = ?2, approved_at = ?3 \
             WHERE task_id = ?1 AND status = 'pending'",
            params![task_id, rejected_by, Utc::now().to_rfc3339()],
        )?;
        let task = Self::fetch(&conn, task_id)?
            .ok_or_else(|| ServiceError::NotFound("Approval task not found".into()))?;
        if updated == 1 {
            Ok(RejectOutcome::Rejected(task))
        } else {
            Ok(RejectOutcome::AlreadyResolved(task))
        }
    }

    async fn list_pending(&self) -> ServiceResult<Vec<ApprovalTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, workflow_id, requester, created_at, payload_hash, status, \
             approved_by, approved_at, approval_data \
             FROM approval_tasks WHERE status = 'pending' ORDER BY created_at ASC",
        )?;
        let tasks = stmt
            .query_map([], Self::row_to_task)
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        Ok(tasks)
    }
}

const RECORD_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS workflow_executions (
    workflow_id      TEXT PRIMARY KEY,
    workflow_pack_id TEXT NOT NULL,
    workflow_type    TEXT NOT NULL,
    payload          TEXT NOT NULL,
    state            TEXT NOT NULL,
    approval_task_id TEXT,
    approved_by      TEXT,
    approved_at      TEXT,
    created_at       TEXT NOT NULL,
    correlation_id   TEXT NOT NULL,
    metadata         TEXT
);
CREATE INDEX IF NOT EXISTS idx_workflow_state ON workflow_executions(state);
";

/// Workflow execution records; payloads are stored redacted.
#[derive(Debug)]
pub struct WorkflowRecordStore {
    conn: DbConn,
}

impl WorkflowRecordStore {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        Self::init(open_connection(path)?)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServiceError::Internal(format!("failed to open workflow db: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(RECORD_SCHEMA_SQL).map_err(|e| {
            ServiceError::Internal(format!("failed to initialise workflow schema: {}", e))
        })?;
        Ok(WorkflowRecordStore {
            conn: DbConn(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .0
            .lock()
            .map_err(|e| ServiceError::Internal(format!("workflow lock poisoned: {}", e)))
    }

    pub fn insert(&self, record: &WorkflowExecutionRecord) -> ServiceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO workflow_executions \
             (workflow_id, workflow_pack_id, workflow_type, payload, state, approval_task_id, \
              approved_by, approved_at, created_at, correlation_id, metadata) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                record.workflow_id,
                record.workflow_pack_id,
                record.workflow_type,
                record.payload.to_string(),
                record.state.as_str(),
                record.approval_task_id,
                record.approved_by,
                record.approved_at.map(|t| t.to_rfc3339()),
                record.created_at.to_rfc3339(),
                record.correlation_id,
                record.metadata.as_ref().map(|m| m.to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn update_state(&self, workflow_id: &str, state: WorkflowState) -> ServiceResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE workflow_executions SET state = ?2 WHERE workflow_id = ?1",
            params![workflow_id, state.as_str()],
        )?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!(
                "workflow {} not found",
                workflow_id
            )));
        }
        Ok(())
    }

    pub fn mark_approved(
        &self,
        workflow_id: &str,
        state: WorkflowState,
        approved_by: &str,
    ) -> ServiceResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE workflow_executions \
             SET state = ?2, approved_by = ?3, approved_at = ?4 WHERE workflow_id = ?1",
            params![
                workflow_id,
                state.as_str(),
                approved_by,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!(
                "workflow {} not found",
                workflow_id
            )));
        }
        Ok(())
    }

    pub fn get(&self, workflow_id: &str) -> ServiceResult<Option<WorkflowExecutionRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT workflow_id, workflow_pack_id, workflow_type, payload, state, \
                 approval_task_id, approved_by, approved_at, created_at, correlation_id, metadata \
                 FROM workflow_executions WHERE workflow_id = ?1",
                [workflow_id],
                |row| {
                    let payload: String = row.get(3)?;
                    let state: String = row.get(4)?;
                    let metadata: Option<String> = row.get(10)?;
                    Ok(WorkflowExecutionRecord {
                        workflow_id: row.get(0)?,
                        workflow_pack_id: row.get(1)?,
                        workflow_type: row.get(2)?,
                        payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::Null),
                        state: WorkflowState::parse(&state).unwrap_or(WorkflowState::Failed),
                        approval_task_id: row.get(5)?,
                        approved_by: row.get(6)?,
                        approved_at: row.get::<_, Option<String>>(7)?.map(parse_ts),
                        created_at: parse_ts(row.get::<_, String>(8)?),
                        correlation_id: row.get(9)?,
                        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}
