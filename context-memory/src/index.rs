//! Per-context HNSW vector index
//!
//! Uses instant-distance HNSW for O(log n) semantic search. An index is built
//! from one snapshot and carries that snapshot's generation. A newer snapshot
//! can still search it, adding an exact pass over the nodes embedded after
//! that generation (see `GraphSnapshot::nearest`).

use std::collections::HashMap;

use instant_distance::{Builder, HnswMap, Point, Search};

use crate::context::MemoryContext;
use crate::node::{MemoryNode, NodeId};

/// HNSW point wrapper for semantic search
#[derive(Clone)]
struct EmbeddingPoint {
    vector: Vec<f32>,
}

impl Point for EmbeddingPoint {
    fn distance(&self, other: &Self) -> f32 {
        // Cosine distance = 1 - similarity (HNSW finds minimum)
        1.0 - cosine_similarity(&self.vector, &other.vector)
    }
}

/// Vector index over the live nodes of every context
pub struct VectorIndex {
    generation: u64,
    per_context: HashMap<MemoryContext, HnswMap<EmbeddingPoint, NodeId>>,
    len: usize,
}

impl VectorIndex {
    /// Build from `(context, node)` pairs captured at `generation`
    pub fn build<'a>(
        generation: u64,
        nodes: impl IntoIterator<Item = &'a MemoryNode>,
    ) -> Self {
        let mut grouped: HashMap<MemoryContext, (Vec<EmbeddingPoint>, Vec<NodeId>)> =
            HashMap::new();
        for node in nodes {
            let (points, ids) = grouped.entry(node.context()).or_default();
            points.push(EmbeddingPoint {
                vector: node.embedding.clone(),
            });
            ids.push(node.id);
        }

        let mut len = 0;
        let per_context = grouped
            .into_iter()
            .filter(|(_, (points, _))| !points.is_empty())
            .map(|(context, (points, ids))| {
                len += ids.len();
                let hnsw = Builder::default().ef_construction(100).build(points, ids);
                (context, hnsw)
            })
            .collect();

        log::debug!("[index] built generation {} with {} vectors", generation, len);

        Self {
            generation,
            per_context,
            len,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Approximate nearest neighbours in `context`, best first.
    ///
    /// Returns ids only; callers re-score against their snapshot.
    pub fn search(&self, context: MemoryContext, query: &[f32], limit: usize) -> Vec<NodeId> {
        let Some(hnsw) = self.per_context.get(&context) else {
            return Vec::new();
        };
        let query_point = EmbeddingPoint {
            vector: query.to_vec(),
        };
        let mut search = Search::default();
        hnsw.search(&query_point, &mut search)
            .take(limit)
            .map(|item| *item.value)
            .collect()
    }
}

/// Calculate cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MemoryNode;

    fn knowledge(concept: &str, embedding: Vec<f32>) -> MemoryNode {
        MemoryNode::builder()
            .knowledge(concept, "definition")
            .content(concept)
            .embedding(embedding)
            .build()
            .unwrap()
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_cosine_similarity_mismatched_length() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_search_finds_nearest_in_context() {
        let nodes = vec![
            knowledge("rust", vec![1.0, 0.0, 0.0]),
            knowledge("python", vec![0.0, 1.0, 0.0]),
            knowledge("go", vec![0.0, 0.0, 1.0]),
        ];
        let index = VectorIndex::build(7, nodes.iter());
        assert_eq!(index.generation(), 7);
        assert_eq!(index.len(), 3);

        let hits = index.search(MemoryContext::Knowledge, &[0.1, 0.9, 0.0], 1);
        assert_eq!(hits, vec![nodes[1].id]);
        assert!(index
            .search(MemoryContext::Experience, &[0.1, 0.9, 0.0], 1)
            .is_empty());
    }
}
