//! Embedding module for semantic search
//!
//! The engine never calls a model directly: embeddings come from an
//! [`EmbeddingProvider`], cached by [`VectorEngine`].

mod engine;
mod hashing;

pub use engine::{EmbeddingProvider, VectorEngine};
pub use hashing::HashingEmbedding;
