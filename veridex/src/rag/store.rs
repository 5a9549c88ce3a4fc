//! SQLite persistence for the hierarchical knowledge base.
//!
//! Embeddings are stored as little-endian f32 blobs; `(document_id, ord)` is
//! unique and `content_hash` deduplicates re-ingested chunks.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::{AccessLevel, Chunk, Document, DocumentLevel, DocumentStatus};
use crate::errors::{ServiceError, ServiceResult};

struct DbConn(Mutex<Connection>);

impl std::fmt::Debug for DbConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DbConn(<sqlite>)")
    }
}

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS documents (
    id           TEXT PRIMARY KEY,
    tenant_id    TEXT NOT NULL,
    level        TEXT NOT NULL,
    suite_id     TEXT,
    module_id    TEXT,
    title        TEXT NOT NULL,
    source_type  TEXT NOT NULL,
    access_level TEXT NOT NULL,
    status       TEXT NOT NULL,
    metadata     TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant_id);
CREATE INDEX IF NOT EXISTS idx_documents_level  ON documents(level);
CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status);

CREATE TABLE IF NOT EXISTS chunks (
    id            TEXT PRIMARY KEY,
    document_id   TEXT NOT NULL,
    ord           INTEGER NOT NULL,
    content       TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    heading       TEXT,
    page_number   INTEGER,
    token_count   INTEGER NOT NULL,
    embedding     BLOB NOT NULL,
    UNIQUE(document_id, ord)
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
CREATE INDEX IF NOT EXISTS idx_chunks_hash     ON chunks(content_hash);

CREATE TABLE IF NOT EXISTS kb_stats (
    document_id       TEXT PRIMARY KEY,
    retrieval_count   INTEGER NOT NULL DEFAULT 0,
    last_retrieved_at TEXT
);
";

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// A chunk joined with its document's hierarchy metadata; the unit the
/// retrieval scorer works over.
#[derive(Debug, Clone)]
pub struct CandidateChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub heading: Option<String>,
    pub page_number: Option<i64>,
    pub embedding: Vec<f32>,
    pub document_title: String,
    pub document_level: DocumentLevel,
    pub document_tenant_id: String,
    pub suite_id: Option<String>,
    pub module_id: Option<String>,
}

#[derive(Debug)]
pub struct KnowledgeStore {
    conn: DbConn,
}

impl KnowledgeStore {
    pub fn open(path: &Path) -> ServiceResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Internal(format!("failed to create knowledge db dir: {}", e))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| ServiceError::Internal(format!("failed to open knowledge db: {}", e)))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServiceError::Internal(format!("failed to open knowledge db: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(CREATE_SCHEMA_SQL).map_err(|e| {
            ServiceError::Internal(format!("failed to initialise knowledge schema: {}", e))
        })?;
        Ok(KnowledgeStore {
            conn: DbConn(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> ServiceResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .0
            .lock()
            .map_err(|e| ServiceError::Internal(format!("knowledge lock poisoned: {}", e)))
    }

    pub fn insert_document(&self, document: &Document) -> ServiceResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO documents \
             (id, tenant_id, level, suite_id, module_id, title, source_type, access_level, \
              status, metadata, created_at, updated_at) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                document.id,
                document.tenant_id,
                document.level.as_str(),
                document.suite_id,
                document.module_id,
                document.title,
                document.source_type,
                document.access_level.as_str(),
                document.status.as_str(),
                document.metadata.to_string(),
                document.created_at.to_rfc3339(),
                document.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_document_status(&self, document_id: &str, status: DocumentStatus) -> ServiceResult<()> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE documents SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                document_id,
                status.as_str(),
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        if updated == 0 {
            return Err(ServiceError::NotFound(format!(
                "document {} not found",
                document_id
            )));
        }
        Ok(())
    }

    pub fn get_document(&self, document_id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.lock()?;
        let document = conn
            .query_row(
                "SELECT id, tenant_id, level, suite_id, module_id, title, source_type, \
                 access_level, status, metadata, created_at, updated_at \
                 FROM documents WHERE id = ?1",
                [document_id],
                |row| {
                    Ok(Document {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        level: DocumentLevel::parse(&row.get::<_, String>(2)?)
                            .unwrap_or(DocumentLevel::Platform),
                        suite_id: row.get(3)?,
                        module_id: row.get(4)?,
                        title: row.get(5)?,
                        source_type: row.get(6)?,
                        access_level: AccessLevel::parse(&row.get::<_, String>(7)?)
                            .unwrap_or(AccessLevel::Internal),
                        status: DocumentStatus::parse(&row.get::<_, String>(8)?)
                            .unwrap_or(DocumentStatus::Active),
                        metadata: serde_json::from_str(&row.get::<_, String>(9)?)
                            .unwrap_or(serde_json::Value::Null),
                        created_at: row
                            .get::<_, String>(10)?
                            .parse()
                            .unwrap_or_else(|_| chrono::Utc::now()),
                        updated_at: row
                            .get::<_, String>(11)?
                            .parse()
                            .unwrap_or_else(|_| chrono::Utc::now()),
                    })
                },
            )
            .optional()?;
        Ok(document)
    }

    /// Insert chunks, skipping content already present in the document
    /// (deduplicated by `content_hash`). Returns the number inserted.
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> ServiceResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        for chunk in chunks {
            let duplicate: Option<String> = tx
                .query_row(
                    "SELECT id FROM chunks WHERE document_id = ?1 AND content_hash = ?2",
                    params![chunk.document_id, chunk.content_hash],
                    |row| row.get(0),
                )
                .optional()?;
            if duplicate.is_some() {
                continue;
            }
            let result = tx.execute(
                "INSERT INTO chunks \
                 (id, document_id, ord, content, content_hash, heading, page_number, \
                  token_count, embedding) \
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    chunk.id,
                    chunk.document_id,
                    chunk.ord,
                    chunk.content,
                    chunk.content_hash,
                    chunk.heading,
                    chunk.page_number,
                    chunk.token_count,
                    encode_embedding(&chunk.embedding),
                ],
            );
            match result {
                Ok(_) => inserted += 1,
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(ServiceError::Conflict(format!(
                        "chunk ord {} already exists for document {}",
                        chunk.ord, chunk.document_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// All active chunks visible to the caller: access level in the requested
    /// set, and entity-level documents only for the caller's tenant.
    pub fn candidates(
        &self,
        tenant_id: &str,
        access_levels: &[AccessLevel],
    ) -> ServiceResult<Vec<CandidateChunk>> {
        let mut levels: Vec<&str> = access_levels.iter().map(|l| l.as_str()).collect();
        // Pad to the fixed placeholder count.
        while levels.len() < 4 {
            levels.push("");
        }
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.document_id, c.content, c.heading, c.page_number, c.embedding, \
             d.title, d.level, d.tenant_id, d.suite_id, d.module_id \
             FROM chunks c JOIN documents d ON c.document_id = d.id \
             WHERE d.status = 'active' \
               AND d.access_level IN (?2, ?3, ?4, ?5) \
               AND (d.level != 'entity' OR d.tenant_id = ?1)",
        )?;
        let rows = stmt
            .query_map(
                params![tenant_id, levels[0], levels[1], levels[2], levels[3]],
                |row| {
                    Ok(CandidateChunk {
                        chunk_id: row.get(0)?,
                        document_id: row.get(1)?,
                        content: row.get(2)?,
                        heading: row.get(3)?,
                        page_number: row.get(4)?,
                        embedding: decode_embedding(&row.get::<_, Vec<u8>>(5)?),
                        document_title: row.get(6)?,
                        document_level: DocumentLevel::parse(&row.get::<_, String>(7)?)
                            .unwrap_or(DocumentLevel::Platform),
                        document_tenant_id: row.get(8)?,
                        suite_id: row.get(9)?,
                        module_id: row.get(10)?,
                    })
                },
            )
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;
        Ok(rows)
    }

    /// Chunk embeddings of every active document, keyed by document id, with
    /// title/level metadata for similarity reporting.
    #[allow(clippy::type_complexity)]
    pub fn document_chunk_embeddings(
        &self,
    ) -> ServiceResult<HashMap<String, (String, DocumentLevel, Option<String>, Option<String>, Vec<Vec<f32>>)>>
    {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.document_id, c.embedding, d.title, d.level, d.suite_id, d.module_id \
             FROM chunks c JOIN documents d ON c.document_id = d.id \
             WHERE d.status = 'active'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    decode_embedding(&row.get::<_, Vec<u8>>(1)?),
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .and_then(|mapped| mapped.collect::<Result<Vec<_>, _>>())?;

        let mut grouped: HashMap<String, (String, DocumentLevel, Option<String>, Option<String>, Vec<Vec<f32>>)> =
            HashMap::new();
        for (document_id, embedding, title, level, suite_id, module_id) in rows {
            grouped
                .entry(document_id)
                .or_insert_with(|| {
                    (
                        title,
                        DocumentLevel::parse(&level).unwrap_or(DocumentLevel::Platform),
                        suite_id,
                        module_id,
                        Vec::new(),
                    )
                })
                .4
                .push(embedding);
        }
        Ok(grouped)
    }

    /// Increment retrieval stats for the given documents, creating rows on
    /// first use.
    pub fn bump_retrieval_stats(&self, document_ids: &[String]) -> ServiceResult<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.lock()?;
        for document_id in document_ids {
            conn.execute(
                "INSERT INTO kb_stats (document_id, retrieval_count, last_retrieved_at) \
                 VALUES (?1, 1, ?2) \
                 ON CONFLICT(document_id) DO UPDATE SET \
                 retrieval_count = retrieval_count + 1, last_retrieved_at = ?2",
                params![document_id, now],
            )?;
        }
        Ok(())
    }

    pub fn retrieval_stats(&self, document_id: &str) -> ServiceResult<Option<(i64, Option<String>)>> {
        let conn = self.lock()?;
        let stats = conn
            .query_row(
                "SELECT retrieval_count, last_retrieved_at FROM kb_stats WHERE document_id = ?1",
                [document_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(stats)
    }
}
