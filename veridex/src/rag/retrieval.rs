//! Cascading and hybrid retrieval.
//!
//! Base similarity is the dot product against the query embedding; the
//! document's hierarchy position adds a context boost on top. Hybrid mode
//! fuses a keyword rank into the base score before boosting. Stats updates
//! never fail a retrieval.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::errors::{ServiceError, ServiceResult};

use super::embedding::{dot, mean_embedding, Embedder};
use super::store::{CandidateChunk, KnowledgeStore};
use super::{AccessLevel, DocumentLevel, RetrievalContext, RetrievedChunk, SimilarDocument};

/// Additive context boosts by hierarchy match.
pub const ENTITY_BOOST: f64 = 0.15;
pub const MODULE_BOOST: f64 = 0.10;
pub const SUITE_BOOST: f64 = 0.05;

/// Admission floor for the vector leg of hybrid retrieval.
const HYBRID_SIMILARITY_FLOOR: f64 = 0.5;

pub fn default_access_levels() -> Vec<AccessLevel> {
    vec![AccessLevel::Public, AccessLevel::Internal]
}

/// Context boost for one candidate under the caller's context.
pub fn context_boost(candidate: &CandidateChunk, context: &RetrievalContext) -> f64 {
    match candidate.document_level {
        DocumentLevel::Entity if candidate.document_tenant_id == context.tenant_id => ENTITY_BOOST,
        DocumentLevel::Module
            if context.module_id.is_some() && candidate.module_id == context.module_id =>
        {
            MODULE_BOOST
        }
        DocumentLevel::Suite
            if context.suite_id.is_some() && candidate.suite_id == context.suite_id =>
        {
            SUITE_BOOST
        }
        _ => 0.0,
    }
}

fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Keyword relevance in [0, 1]: per-token term frequency with saturation,
/// averaged over the query's unique tokens.
pub fn keyword_rank(content: &str, tokens: &[String]) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let content = content.to_lowercase();
    let content_tokens: Vec<&str> = content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    if content_tokens.is_empty() {
        return 0.0;
    }
    let mut score = 0.0;
    for token in tokens {
        let tf = content_tokens.iter().filter(|t| *t == token).count() as f64;
        score += tf / (tf + 1.0);
    }
    score / tokens.len() as f64
}

fn candidate_to_chunk(
    candidate: CandidateChunk,
    similarity: f64,
    boost: f64,
    final_score: f64,
) -> RetrievedChunk {
    RetrievedChunk {
        chunk_id: candidate.chunk_id,
        document_id: candidate.document_id,
        content: candidate.content,
        heading: candidate.heading,
        page_number: candidate.page_number,
        document_title: candidate.document_title,
        document_level: candidate.document_level,
        suite_id: candidate.suite_id,
        module_id: candidate.module_id,
        similarity,
        context_boost: boost,
        final_score,
    }
}

pub struct RetrievalEngine {
    store: Arc<KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        config: RetrievalConfig,
    ) -> Self {
        RetrievalEngine {
            store,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    fn check_top_k(top_k: usize) -> ServiceResult<()> {
        if top_k == 0 {
            return Err(ServiceError::InvalidInput(
                "top_k must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn finish(
        &self,
        mut scored: Vec<RetrievedChunk>,
        top_k: usize,
    ) -> Vec<RetrievedChunk> {
        scored.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);

        if !scored.is_empty() {
            let document_ids: Vec<String> = scored
                .iter()
                .map(|c| c.document_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            if let Err(e) = self.store.bump_retrieval_stats(&document_ids) {
                log::warn!("failed to update retrieval stats: {}", e);
            }
        }
        scored
    }

    /// Cascading retrieval: vector similarity, thresholded, context-boosted.
    pub fn cascading(
        &self,
        query: &str,
        context: &RetrievalContext,
        top_k: usize,
        similarity_threshold: f64,
        access_levels: &[AccessLevel],
    ) -> ServiceResult<Vec<RetrievedChunk>> {
        Self::check_top_k(top_k)?;
        let query_embedding = self.embedder.embed(query)?;
        let candidates = self.store.candidates(&context.tenant_id, access_levels)?;

        let scored = candidates
            .into_iter()
            .filter_map(|candidate| {
                let similarity = dot(&candidate.embedding, &query_embedding);
                if similarity < similarity_threshold {
                    return None;
                }
                let boost = context_boost(&candidate, context);
                Some(candidate_to_chunk(
                    candidate,
                    similarity,
                    boost,
                    similarity + boost,
                ))
            })
            .collect();

        let results = self.finish(scored, top_k);
        log::info!(
            "cascading retrieval returned {} chunks for tenant {}",
            results.len(),
            context.tenant_id
        );
        Ok(results)
    }

    /// Hybrid retrieval: weighted fusion of vector similarity and keyword
    /// rank. Candidates are admitted on a keyword hit OR similarity >= 0.5.
    pub fn hybrid(
        &self,
        query: &str,
        context: &RetrievalContext,
        top_k: usize,
        access_levels: &[AccessLevel],
    ) -> ServiceResult<Vec<RetrievedChunk>> {
        Self::check_top_k(top_k)?;
        let query_embedding = self.embedder.embed(query)?;
        let tokens = query_tokens(query);
        let candidates = self.store.candidates(&context.tenant_id, access_levels)?;

        let vector_weight = self.config.vector_weight;
        let keyword_weight = self.config.keyword_weight;
        let scored = candidates
            .into_iter()
            .filter_map(|candidate| {
                let similarity = dot(&candidate.embedding, &query_embedding);
                let keyword = keyword_rank(&candidate.content, &tokens);
                if keyword <= 0.0 && similarity < HYBRID_SIMILARITY_FLOOR {
                    return None;
                }
                let boost = context_boost(&candidate, context);
                let final_score = vector_weight * similarity + keyword_weight * keyword + boost;
                Some(candidate_to_chunk(candidate, similarity, boost, final_score))
            })
            .collect();

        let results = self.finish(scored, top_k);
        log::info!(
            "hybrid retrieval returned {} chunks for tenant {}",
            results.len(),
            context.tenant_id
        );
        Ok(results)
    }

    /// Documents similar to the given one, by average-chunk-embedding
    /// similarity at or above `min_similarity`.
    pub fn similar_documents(
        &self,
        document_id: &str,
        top_k: usize,
        min_similarity: f64,
    ) -> ServiceResult<Vec<SimilarDocument>> {
        Self::check_top_k(top_k)?;
        let grouped = self.store.document_chunk_embeddings()?;
        let Some((_, _, _, _, target_chunks)) = grouped.get(document_id) else {
            return Err(ServiceError::NotFound(format!(
                "document {} not found",
                document_id
            )));
        };
        let dimension = self.embedder.dimension();
        let target = mean_embedding(target_chunks, dimension);

        let mut similar: Vec<SimilarDocument> = grouped
            .iter()
            .filter(|(id, _)| id.as_str() != document_id)
            .filter_map(|(id, (title, level, suite_id, module_id, chunks))| {
                let candidate = mean_embedding(chunks, dimension);
                let similarity = dot(&target, &candidate);
                if similarity < min_similarity {
                    return None;
                }
                Some(SimilarDocument {
                    id: id.clone(),
                    title: title.clone(),
                    level: *level,
                    suite_id: suite_id.clone(),
                    module_id: module_id.clone(),
                    similarity,
                })
            })
            .collect();
        similar.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        similar.truncate(top_k);
        Ok(similar)
    }
}
