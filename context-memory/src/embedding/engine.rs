//! Vector embedding engine
//!
//! High-level API for generating and caching embeddings.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{MemoryError, Result};

/// Cached embeddings kept by default
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Source of text embeddings
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Length of every vector this provider returns
    fn dimension(&self) -> usize;

    /// Embed several texts; providers with a native batch path override this
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Vector embedding engine with caching
///
/// Wraps a provider with a bounded LRU cache; the least recently used
/// text is evicted once the cache is full.
pub struct VectorEngine {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    dimension: usize,
}

impl VectorEngine {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::with_cache_capacity(provider, DEFAULT_CACHE_CAPACITY)
    }

    /// Engine caching at most `capacity` embeddings (at least one)
    pub fn with_cache_capacity(provider: Arc<dyn EmbeddingProvider>, capacity: usize) -> Self {
        let dimension = provider.dimension();
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        log::info!(
            "[embedding] VectorEngine ready ({}d, cache {})",
            dimension,
            capacity
        );
        Self {
            provider,
            cache: Mutex::new(LruCache::new(capacity)),
            dimension,
        }
    }

    /// Generate embedding with caching
    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.lock().get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.provider.embed(text)?;
        self.check_dimension(&embedding)?;
        self.cache.lock().put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// Batch embed with caching
    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = texts
            .iter()
            .map(|text| self.cache.lock().get(*text).cloned())
            .collect();

        let uncached: Vec<(usize, &str)> = results
            .iter()
            .enumerate()
            .filter(|(_, cached)| cached.is_none())
            .map(|(i, _)| (i, texts[i]))
            .collect();

        if uncached.is_empty() {
            return Ok(results.into_iter().flatten().collect());
        }

        let uncached_texts: Vec<&str> = uncached.iter().map(|(_, t)| *t).collect();
        let new_embeddings = self.provider.embed_batch(&uncached_texts)?;
        if new_embeddings.len() != uncached_texts.len() {
            return Err(MemoryError::embedding(format!(
                "provider returned {} embeddings for {} texts",
                new_embeddings.len(),
                uncached_texts.len()
            )));
        }

        for ((idx, text), emb) in uncached.iter().zip(new_embeddings.into_iter()) {
            self.check_dimension(&emb)?;
            self.cache.lock().put(text.to_string(), emb.clone());
            results[*idx] = Some(emb);
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(MemoryError::embedding(format!(
                "provider returned {} dimensions, expected {}",
                embedding.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    /// Get embedding dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}
