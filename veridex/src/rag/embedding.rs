//! Query and chunk embeddings.
//!
//! Embeddings are fixed 384-dimensional unit vectors, so every cosine
//! comparison in the crate reduces to a dot product. The embedding model is
//! an external collaborator behind [`Embedder`]; the bundled
//! [`HashingEmbedder`] is a deterministic token-hashing projection used for
//! local deployments and tests.

use sha2::{Digest, Sha256};

use crate::errors::{ServiceError, ServiceResult};

/// Fixed embedding dimensionality across the knowledge base.
pub const EMBEDDING_DIM: usize = 384;

pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    /// Deterministic for a fixed input; the result is L2-normalized.
    fn embed(&self, text: &str) -> ServiceResult<Vec<f32>>;

    /// Warm the model at service startup; default is a no-op.
    fn warm(&self) -> ServiceResult<()> {
        Ok(())
    }
}

/// Dot product; equal to cosine similarity for unit vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| *x as f64 * *y as f64).sum()
}

pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt()
}

/// Normalize in place; an all-zero vector becomes the first basis vector so
/// the unit-norm invariant holds unconditionally.
pub fn normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm <= f64::EPSILON {
        if let Some(first) = v.first_mut() {
            *first = 1.0;
        }
        return;
    }
    for x in v.iter_mut() {
        *x = (*x as f64 / norm) as f32;
    }
}

/// Average a set of unit vectors and renormalize; used for document-level
/// similarity.
pub fn mean_embedding(vectors: &[Vec<f32>], dimension: usize) -> Vec<f32> {
    let mut mean = vec![0.0f32; dimension];
    if vectors.is_empty() {
        normalize(&mut mean);
        return mean;
    }
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v) {
            *m += x;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    normalize(&mut mean);
    mean
}

/// Deterministic token-hashing embedder.
///
/// Each lowercase alphanumeric token is hashed; the digest picks a dimension
/// and a sign, and token counts accumulate before normalization. Not a
/// semantic model, but stable, unit-norm, and adequate wherever the real
/// model is plugged in behind the same trait.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        HashingEmbedder {
            dimension: EMBEDDING_DIM,
        }
    }

    pub fn with_dimension(dimension: usize) -> Self {
        HashingEmbedder { dimension }
    }

    fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        if self.dimension == 0 {
            return Err(ServiceError::Internal(
                "embedder dimension must be positive".to_string(),
            ));
        }
        let mut vector = vec![0.0f32; self.dimension];
        for token in Self::tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
            let index = (bucket % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_is_deterministic_and_unit_norm() {
        let embedder = HashingEmbedder::new();
        let a = embedder.embed("obligation must balance by fund symbol").unwrap();
        let b = embedder.embed("obligation must balance by fund symbol").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-2);
    }

    #[test]
    fn test_empty_text_still_unit_norm() {
        let embedder = HashingEmbedder::new();
        let v = embedder.embed("").unwrap();
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similar_texts_score_higher_than_unrelated() {
        let embedder = HashingEmbedder::new();
        let q = embedder.embed("fund balance reconciliation").unwrap();
        let near = embedder
            .embed("reconciliation of the fund balance ledger")
            .unwrap();
        let far = embedder.embed("tesseract deskew page rotation").unwrap();
        assert!(dot(&q, &near) > dot(&q, &far));
    }

    #[test]
    fn test_dot_of_identical_unit_vectors_is_one() {
        let embedder = HashingEmbedder::new();
        let v = embedder.embed("identical").unwrap();
        assert!((dot(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_embedding_renormalizes() {
        let embedder = HashingEmbedder::new();
        let a = embedder.embed("alpha").unwrap();
        let b = embedder.embed("beta").unwrap();
        let mean = mean_embedding(&[a, b], EMBEDDING_DIM);
        assert!((l2_norm(&mean) - 1.0).abs() < 1e-6);
    }
}
