//! Feature-hashing static embeddings
//!
//! Each lowercased word is hashed into one of `dimension` buckets with a
//! ±1 sign, and the bag is L2-normalised. No model files, deterministic
//! across runs, and texts sharing words land close together.

use super::engine::EmbeddingProvider;
use crate::error::{MemoryError, Result};

/// Bag-of-words embedding via the hashing trick
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimension: usize,
}

impl HashingEmbedding {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(MemoryError::embedding("dimension must be > 0"));
        }
        Ok(Self { dimension })
    }
}

impl EmbeddingProvider for HashingEmbedding {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::cosine_similarity;

    #[test]
    fn test_deterministic_and_normalised() {
        let embedder = HashingEmbedding::new(64).unwrap();
        let a = embedder.embed("John helped with the presentation").unwrap();
        let b = embedder.embed("john HELPED with the presentation").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_words_are_closer() {
        let embedder = HashingEmbedding::new(256).unwrap();
        let query = embedder.embed("help with presentation").unwrap();
        let related = embedder.embed("John helped with presentation slides").unwrap();
        let unrelated = embedder.embed("grocery list: eggs milk").unwrap();
        assert!(cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedding::new(8).unwrap();
        assert!(embedder.embed("  ").unwrap().iter().all(|x| *x == 0.0));
        assert!(HashingEmbedding::new(0).is_err());
    }
}
