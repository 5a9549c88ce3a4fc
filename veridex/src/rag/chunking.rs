//! Document chunking for ingestion.
//!
//! Splits source text into paragraph-grouped chunks bounded by an
//! approximate token budget, tracking the nearest markdown heading. Token
//! counts use the len/4 estimator shared with the rest of the platform.

use sha2::{Digest, Sha256};

/// Approximate token count heuristic.
pub fn approx_token_count(content: &str) -> usize {
    (content.len() / 4).max(1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftChunk {
    pub ord: i64,
    pub content: String,
    pub content_hash: String,
    pub heading: Option<String>,
    pub token_count: i64,
}

fn finish_chunk(ord: i64, paragraphs: &[String], heading: Option<&str>) -> DraftChunk {
    let content = paragraphs.join("\n\n");
    let content_hash = format!("{:x}", Sha256::digest(content.as_bytes()));
    DraftChunk {
        ord,
        token_count: approx_token_count(&content) as i64,
        content_hash,
        heading: heading.map(str::to_string),
        content,
    }
}

/// Chunk `text` into ordered drafts, each at most roughly `max_tokens`.
///
/// Paragraphs are never split; a single oversized paragraph becomes its own
/// chunk. Heading lines (`#`-prefixed) attach to the chunks that follow them.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<DraftChunk> {
    let max_tokens = max_tokens.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;
    let mut heading: Option<String> = None;
    let mut chunk_heading: Option<String> = None;
    let mut ord = 0i64;

    for raw_paragraph in text.split("\n\n") {
        let paragraph = raw_paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if let Some(title) = paragraph.strip_prefix('#') {
            // Flush before a new section so chunks never span headings.
            if !current.is_empty() {
                chunks.push(finish_chunk(ord, &current, chunk_heading.as_deref()));
                ord += 1;
                current.clear();
                current_tokens = 0;
            }
            heading = Some(title.trim_start_matches('#').trim().to_string());
            chunk_heading = heading.clone();
            continue;
        }

        let tokens = approx_token_count(paragraph);
        if !current.is_empty() && current_tokens + tokens > max_tokens {
            chunks.push(finish_chunk(ord, &current, chunk_heading.as_deref()));
            ord += 1;
            current.clear();
            current_tokens = 0;
            chunk_heading = heading.clone();
        }
        if current.is_empty() {
            chunk_heading = heading.clone();
        }
        current.push(paragraph.to_string());
        current_tokens += tokens;
    }

    if !current.is_empty() {
        chunks.push(finish_chunk(ord, &current, chunk_heading.as_deref()));
    }
    chunks
}
