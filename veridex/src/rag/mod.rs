//! Hierarchical retrieval-augmented knowledge base.
//!
//! Documents live at four levels - platform (universal), suite (domain
//! family), module (within a suite), entity (tenant-scoped) - and retrieval
//! boosts candidates whose level matches the caller's context. A semantic
//! query cache sits in front of the full pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::errors::{ServiceError, ServiceResult};

pub mod cache;
pub mod chunking;
pub mod embedding;
pub mod retrieval;
pub mod store;

pub use cache::{CacheKey, CachedAnswer, QueryCache};
pub use chunking::{approx_token_count, chunk_text};
pub use embedding::{Embedder, HashingEmbedder, EMBEDDING_DIM};
pub use retrieval::{default_access_levels, RetrievalEngine};
pub use store::KnowledgeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentLevel {
    Platform,
    Suite,
    Module,
    Entity,
}

impl DocumentLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentLevel::Platform => "platform",
            DocumentLevel::Suite => "suite",
            DocumentLevel::Module => "module",
            DocumentLevel::Entity => "entity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "platform" => DocumentLevel::Platform,
            "suite" => DocumentLevel::Suite,
            "module" => DocumentLevel::Module,
            "entity" => DocumentLevel::Entity,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Public => "public",
            AccessLevel::Internal => "internal",
            AccessLevel::Confidential => "confidential",
            AccessLevel::Restricted => "restricted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "public" => AccessLevel::Public,
            "internal" => AccessLevel::Internal,
            "confidential" => AccessLevel::Confidential,
            "restricted" => AccessLevel::Restricted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Active,
    Archived,
    Deleted,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Active => "active",
            DocumentStatus::Archived => "archived",
            DocumentStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => DocumentStatus::Active,
            "archived" => DocumentStatus::Archived,
            "deleted" => DocumentStatus::Deleted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    pub level: DocumentLevel,
    #[serde(default)]
    pub suite_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    pub title: String,
    pub source_type: String,
    pub access_level: AccessLevel,
    pub status: DocumentStatus,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub ord: i64,
    pub content: String,
    pub content_hash: String,
    pub heading: Option<String>,
    pub page_number: Option<i64>,
    pub token_count: i64,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct RetrievalContext {
    pub tenant_id: String,
    pub user_id: String,
    pub suite_id: Option<String>,
    pub module_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<i64>,
    pub document_title: String,
    pub document_level: DocumentLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suite_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    pub similarity: f64,
    pub context_boost: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarDocument {
    pub id: String,
    pub title: String,
    pub level: DocumentLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suite_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    pub similarity: f64,
}

/// Document attributes supplied at ingestion time.
#[derive(Debug, Clone, Deserialize)]
pub struct NewDocument {
    pub tenant_id: String,
    pub level: DocumentLevel,
    #[serde(default)]
    pub suite_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    pub title: String,
    #[serde(default = "default_source_type")]
    pub source_type: String,
    #[serde(default = "default_access_level")]
    pub access_level: AccessLevel,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn default_source_type() -> String {
    "markdown".to_string()
}

fn default_access_level() -> AccessLevel {
    AccessLevel::Internal
}

#[derive(Debug, Clone, Deserialize)]
pub struct RagQueryRequest {
    pub query: String,
    #[serde(default)]
    pub suite_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub use_hybrid: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub access_levels: Option<Vec<AccessLevel>>,
}

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> usize {
    512
}

#[derive(Debug, Clone, Serialize)]
pub struct RagQueryResponse {
    pub response_text: String,
    pub chunks: Vec<RetrievedChunk>,
    pub cached: bool,
    pub query_hash: String,
}

/// The RAG service: retrieval engine, ingestion, and the semantic cache.
pub struct RagService {
    engine: RetrievalEngine,
    cache: QueryCache,
    store: Arc<KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
}

impl RagService {
    pub fn new(
        store: Arc<KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        let cache = QueryCache::new(config.cache_ttl_secs);
        let engine = RetrievalEngine::new(store.clone(), embedder.clone(), config);
        RagService {
            engine,
            cache,
            store,
            embedder,
        }
    }

    /// Warm the embedding model; called once at service startup.
    pub fn init(&self) -> ServiceResult<()> {
        self.embedder.warm()
    }

    /// Flush the semantic cache; called at shutdown.
    pub fn shutdown(&self) {
        self.cache.clear();
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Ingest a document: chunk, embed, persist. Returns the document id and
    /// the number of chunks stored.
    pub fn ingest(&self, new: &NewDocument, text: &str) -> ServiceResult<(String, usize)> {
        if new.title.is_empty() {
            return Err(ServiceError::InvalidInput(
                "document title must not be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            tenant_id: new.tenant_id.clone(),
            level: new.level,
            suite_id: new.suite_id.clone(),
            module_id: new.module_id.clone(),
            title: new.title.clone(),
            source_type: new.source_type.clone(),
            access_level: new.access_level,
            status: DocumentStatus::Active,
            metadata: new.metadata.clone().unwrap_or(Value::Null),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_document(&document)?;

        let drafts = chunk_text(text, 320);
        let chunks: Vec<Chunk> = drafts
            .into_iter()
            .map(|draft| {
                Ok(Chunk {
                    id: Uuid::new_v4().to_string(),
                    document_id: document.id.clone(),
                    ord: draft.ord,
                    embedding: self.embedder.embed(&draft.content)?,
                    content: draft.content,
                    content_hash: draft.content_hash,
                    heading: draft.heading,
                    page_number: None,
                    token_count: draft.token_count,
                })
            })
            .collect::<ServiceResult<_>>()?;
        let inserted = self.store.insert_chunks(&chunks)?;
        log::info!(
            "ingested document '{}' ({} chunks) at level {}",
            document.title,
            inserted,
            document.level.as_str()
        );
        Ok((document.id, inserted))
    }

    /// Chunks-only retrieval.
    pub fn retrieve(
        &self,
        request: &RagQueryRequest,
        context: &RetrievalContext,
    ) -> ServiceResult<Vec<RetrievedChunk>> {
        if request.query.trim().is_empty() {
            return Err(ServiceError::InvalidInput(
                "query must not be empty".to_string(),
            ));
        }
        let top_k = request.top_k.unwrap_or(self.engine.config().top_k);
        let access_levels = request
            .access_levels
            .clone()
            .unwrap_or_else(default_access_levels);
        if request.use_hybrid {
            self.engine
                .hybrid(&request.query, context, top_k, &access_levels)
        } else {
            self.engine.cascading(
                &request.query,
                context,
                top_k,
                self.engine.config().similarity_threshold,
                &access_levels,
            )
        }
    }

    /// Full query path: semantic cache in front of retrieval plus response
    /// composition. Cache misses populate the cache with the generated
    /// response and the chunk/document ids it drew from.
    pub fn query(
        &self,
        request: &RagQueryRequest,
        context: &RetrievalContext,
    ) -> ServiceResult<RagQueryResponse> {
        let key = CacheKey::new(
            &request.query,
            &context.tenant_id,
            request.suite_id.as_deref().or(context.suite_id.as_deref()),
            request.module_id.as_deref().or(context.module_id.as_deref()),
        );

        if request.use_cache {
            if let Some(hit) = self.cache.get(&key, Utc::now()) {
                log::debug!("query cache hit for tenant {}", context.tenant_id);
                return Ok(RagQueryResponse {
                    response_text: hit.response_text,
                    chunks: Vec::new(),
                    cached: true,
                    query_hash: key.query_hash,
                });
            }
        }

        let chunks = self.retrieve(request, context)?;
        let response_text = compose_response(&request.query, &chunks, request.max_tokens);

        if request.use_cache {
            let chunk_ids = chunks.iter().map(|c| c.chunk_id.clone()).collect();
            let document_ids = chunks.iter().map(|c| c.document_id.clone()).collect();
            let query_embedding = self.embedder.embed(&request.query)?;
            self.cache.put(
                key.clone(),
                response_text.clone(),
                chunk_ids,
                document_ids,
                query_embedding,
                Utc::now(),
            );
        }

        Ok(RagQueryResponse {
            response_text,
            chunks,
            cached: false,
            query_hash: key.query_hash,
        })
    }

    pub fn similar_documents(
        &self,
        document_id: &str,
        top_k: usize,
        min_similarity: f64,
    ) -> ServiceResult<Vec<SimilarDocument>> {
        self.engine
            .similar_documents(document_id, top_k, min_similarity)
    }
}

/// Compose a grounded response from the retrieved chunks, bounded by the
/// caller's token budget (len/4 estimator).
fn compose_response(query: &str, chunks: &[RetrievedChunk], max_tokens: usize) -> String {
    if chunks.is_empty() {
        return format!(
            "No knowledge base passages matched the query \"{}\".",
            query.trim()
        );
    }
    let budget_chars = max_tokens.max(32) * 4;
    let mut out = String::new();
    for chunk in chunks {
        let header = match &chunk.heading {
            Some(heading) => format!("{} - {}", chunk.document_title, heading),
            None => chunk.document_title.clone(),
        };
        let section = format!("[{}]\n{}\n\n", header, chunk.content.trim());
        if out.len() + section.len() > budget_chars {
            break;
        }
        out.push_str(&section);
    }
    if out.is_empty() {
        // The first chunk alone blew the budget; hard-truncate it.
        let chunk = &chunks[0];
        let mut clipped = chunk.content.clone();
        clipped.truncate(budget_chars);
        out = format!("[{}]\n{}", chunk.document_title, clipped);
    }
    out.trim_end().to_string()
}
