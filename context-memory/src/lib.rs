//! Context Memory
//!
//! Long-term, graph-structured memory for a conversational agent. Memories
//! are typed nodes in four contexts (Experience, Knowledge, Relationship,
//! Current) linked by typed, weighted, directed edges.
//!
//! ## Features
//!
//! - **Relevance vectors** - Each node scores how pertinent it is from every other context
//! - **Lazy decay + reinforcement** - Exponential decay per context, diminishing boosts on use
//! - **Relationship inference** - New nodes are linked to similar nodes of the other contexts
//! - **Consolidation** - Background merge of near-duplicates, pruning, schema evolution
//! - **Dual-mode retrieval** - HNSW vector search + bounded graph traversal under a time budget
//! - **RocksDB persistence** - Atomic write batches behind copy-on-write snapshots
//!
//! ## Example
//!
//! ```ignore
//! use context_memory::{
//!     EngineConfig, HashingEmbedding, MemoryContext, MemoryEngine, NodeDetails, NodeProposal,
//! };
//!
//! let engine = MemoryEngine::open(&db_path, EngineConfig::default())?
//!     .with_embedder(Arc::new(HashingEmbedding::new(384)?))?;
//!
//! let id = engine
//!     .propose_node(
//!         NodeProposal::new(details, "John helped with presentation")
//!             .with_relevance(MemoryContext::Relationship, 0.9),
//!     )
//!     .await?;
//!
//! let package = engine.retrieve_text(
//!     "need help with presentation",
//!     Some(MemoryContext::Current),
//!     None,
//! )?;
//! for memory in &package.experience {
//!     engine.reinforce(memory.node.id).await?;
//! }
//! ```

pub mod clock;
pub mod config;
pub mod consolidation;
pub mod context;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod inference;
pub mod migration;
pub mod node;
pub mod relationship;
pub mod relevance;
pub mod search;
mod shard;
pub mod storage;
pub mod temporal;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use consolidation::{ConsolidationScheduler, ConsolidationScope, MergeReport, SweepReport};
pub use context::{MemoryContext, RelevanceVector};
pub use embedding::{EmbeddingProvider, HashingEmbedding, VectorEngine};
pub use engine::{EngineStats, MemoryEngine, ReinforceTarget};
pub use error::{MemoryError, Result};
pub use node::{
    CurrentDetails, ExperienceDetails, KnowledgeDetails, MemoryNode, MemoryNodeBuilder, NodeDetails,
    NodeId, NodeProposal, RelationshipDetails,
};
pub use relationship::{EdgeId, MemoryEdge, RelationshipType};
pub use search::{ContextPackage, MatchReason, RetrievalQuery, RetrievedMemory};
pub use storage::{Direction, GraphStore, ListFilter, SearchPlan};
pub use temporal::Lifecycle;
