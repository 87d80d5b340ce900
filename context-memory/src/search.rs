//! Dual-mode retrieval
//!
//! Combines vector similarity per context with a bounded traversal of the
//! relationship graph out of the anchor context, then ranks each context's
//! candidates by
//!
//! `score = α·similarity + β·graph proximity + γ·relevance[anchor]`
//!
//! Everything runs against one snapshot, so a concurrent consolidation never
//! shows up half-applied. Work stops at the next step once the time budget
//! runs out and the best candidates found so far are returned.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::context::{clamp_unit, MemoryContext};
use crate::error::{MemoryError, Result};
use crate::index::{cosine_similarity, VectorIndex};
use crate::node::{MemoryNode, NodeId};
use crate::relationship::{EdgeId, MemoryEdge};
use crate::relevance::{effective_relevance, effective_strength};
use crate::storage::{Direction, GraphSnapshot};

/// A retrieval request
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub embedding: Vec<f32>,
    /// Original query text, kept for logging
    pub text: Option<String>,
    /// Context the conversation is anchored in, e.g. Current
    pub anchor: Option<MemoryContext>,
    /// Time budget; the configured default when unset
    pub budget: Option<Duration>,
}

impl RetrievalQuery {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            text: None,
            anchor: None,
            budget: None,
        }
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn anchor(mut self, context: MemoryContext) -> Self {
        self.anchor = Some(context);
        self
    }

    pub fn budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Why a memory was included
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MatchReason {
    SemanticSimilarity { score: f32 },
    /// Reached through the graph; `edge` is the last hop
    GraphProximity { score: f32, edge: EdgeId },
    ContextRelevance { score: f32 },
}

/// A ranked memory in a [`ContextPackage`]
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedMemory {
    pub node: MemoryNode,
    /// Combined score
    pub score: f32,
    pub similarity: f32,
    pub proximity: f32,
    pub relevance: f32,
    pub match_reasons: Vec<MatchReason>,
}

/// Ranked memories per context plus the edges that pulled graph-proximate
/// memories in
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextPackage {
    pub experience: Vec<RetrievedMemory>,
    pub knowledge: Vec<RetrievedMemory>,
    pub relationship: Vec<RetrievedMemory>,
    pub current: Vec<RetrievedMemory>,
    pub justifying_edges: Vec<MemoryEdge>,
    /// The budget ran out before retrieval finished
    pub truncated: bool,
    /// Snapshot generation the package was read from
    pub generation: u64,
    pub elapsed_ms: u64,
}

impl ContextPackage {
    pub fn for_context(&self, context: MemoryContext) -> &[RetrievedMemory] {
        match context {
            MemoryContext::Experience => &self.experience,
            MemoryContext::Knowledge => &self.knowledge,
            MemoryContext::Relationship => &self.relationship,
            MemoryContext::Current => &self.current,
        }
    }

    fn for_context_mut(&mut self, context: MemoryContext) -> &mut Vec<RetrievedMemory> {
        match context {
            MemoryContext::Experience => &mut self.experience,
            MemoryContext::Knowledge => &mut self.knowledge,
            MemoryContext::Relationship => &mut self.relationship,
            MemoryContext::Current => &mut self.current,
        }
    }

    /// All memories, context by context
    pub fn iter(&self) -> impl Iterator<Item = &RetrievedMemory> {
        MemoryContext::ALL
            .into_iter()
            .flat_map(move |c| self.for_context(c).iter())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.iter().any(|m| m.node.id == id)
    }

    /// Fail with `BudgetExceeded` if the package is partial
    pub fn require_complete(self) -> Result<Self> {
        if self.truncated {
            return Err(MemoryError::BudgetExceeded {
                elapsed_ms: self.elapsed_ms,
            });
        }
        Ok(self)
    }
}

struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    fn expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Default)]
struct Candidate {
    similarity: Option<f32>,
    proximity: f32,
    via: Option<EdgeId>,
}

/// Retrieval over one snapshot
pub struct MemorySearch<'a> {
    snapshot: &'a GraphSnapshot,
    index: Option<&'a VectorIndex>,
    config: &'a EngineConfig,
    now: DateTime<Utc>,
}

impl<'a> MemorySearch<'a> {
    pub fn new(
        snapshot: &'a GraphSnapshot,
        index: Option<&'a VectorIndex>,
        config: &'a EngineConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            snapshot,
            index,
            config,
            now,
        }
    }

    pub fn retrieve(&self, query: &RetrievalQuery) -> ContextPackage {
        let retrieval = &self.config.retrieval;
        let deadline = Deadline::new(
            query
                .budget
                .unwrap_or(Duration::from_millis(retrieval.default_budget_ms)),
        );
        let mut truncated = false;
        let mut candidates: HashMap<NodeId, Candidate> = HashMap::new();

        // 1. Vector search, anchor context first so its seeds survive a
        //    short budget
        let mut order: Vec<MemoryContext> = query.anchor.into_iter().collect();
        order.extend(MemoryContext::ALL.into_iter().filter(|c| Some(*c) != query.anchor));
        let mut semantic: HashMap<MemoryContext, Vec<(NodeId, f32)>> = HashMap::new();
        for context in order {
            if deadline.expired() {
                truncated = true;
                break;
            }
            let hits = self.snapshot.nearest(
                context,
                &query.embedding,
                retrieval.semantic_candidates,
                self.index,
                true,
            );
            for (id, similarity) in &hits {
                candidates.entry(*id).or_default().similarity = Some(*similarity);
            }
            semantic.insert(context, hits);
        }

        // 2. Graph traversal out of the best seeds
        let seeds = self.seeds(query.anchor, &semantic);
        let mut parents: HashMap<NodeId, (EdgeId, NodeId)> = HashMap::new();
        if !truncated && !seeds.is_empty() {
            truncated = self.traverse(query.anchor, &seeds, &deadline, &mut candidates, &mut parents);
        }

        // 3. Rank per context
        let mut package = ContextPackage {
            generation: self.snapshot.generation(),
            truncated,
            ..ContextPackage::default()
        };
        let mut ranked: HashMap<MemoryContext, Vec<RetrievedMemory>> = HashMap::new();
        for (id, candidate) in &candidates {
            let Some(record) = self.snapshot.live_node(*id) else {
                continue;
            };
            let memory = self.score(&record.node, candidate, query);
            ranked.entry(record.node.context()).or_default().push(memory);
        }

        // 4. Truncate to top-N and collect the edges behind each inclusion
        let mut edge_ids: BTreeSet<EdgeId> = BTreeSet::new();
        for (context, mut memories) in ranked {
            memories.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.node.last_accessed_at.cmp(&a.node.last_accessed_at))
                    .then_with(|| a.node.id.cmp(&b.node.id))
            });
            memories.truncate(retrieval.top_n);
            for memory in &memories {
                if memory.proximity > 0.0 {
                    self.collect_path(memory.node.id, &parents, &mut edge_ids);
                }
            }
            *package.for_context_mut(context) = memories;
        }
        package.justifying_edges = edge_ids
            .into_iter()
            .filter_map(|id| self.snapshot.edge(id))
            .map(|r| r.edge.clone())
            .collect();
        package.elapsed_ms = deadline.elapsed_ms();

        if package.truncated {
            log::warn!(
                "[retrieval] budget of {:?} exhausted after {}ms, returning {} partial results",
                deadline.budget,
                package.elapsed_ms,
                package.len()
            );
        } else {
            log::debug!(
                "[retrieval] {:?} -> {} memories, {} edges in {}ms",
                query.text.as_deref().unwrap_or("<embedding>"),
                package.len(),
                package.justifying_edges.len(),
                package.elapsed_ms
            );
        }
        package
    }

    /// Highest-similarity nodes of the anchor context, or of every context
    /// when there is no anchor
    fn seeds(
        &self,
        anchor: Option<MemoryContext>,
        semantic: &HashMap<MemoryContext, Vec<(NodeId, f32)>>,
    ) -> Vec<NodeId> {
        let seed_count = self.config.retrieval.seed_count;
        let mut pool: Vec<(NodeId, f32)> = match anchor {
            Some(context) => semantic.get(&context).cloned().unwrap_or_default(),
            None => semantic.values().flatten().copied().collect(),
        };
        pool.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        pool.into_iter().take(seed_count).map(|(id, _)| id).collect()
    }

    /// Breadth-first walk to `traversal_depth` hops. A hop multiplies the
    /// path weight by the edge's decayed strength and its relevance from the
    /// anchor context; each node keeps its best path. Returns true if the
    /// budget ran out.
    fn traverse(
        &self,
        anchor: Option<MemoryContext>,
        seeds: &[NodeId],
        deadline: &Deadline,
        candidates: &mut HashMap<NodeId, Candidate>,
        parents: &mut HashMap<NodeId, (EdgeId, NodeId)>,
    ) -> bool {
        let decay = &self.config.decay;
        let mut best: HashMap<NodeId, f32> = seeds.iter().map(|id| (*id, 1.0)).collect();
        let mut frontier: Vec<NodeId> = seeds.to_vec();

        for _ in 0..self.config.retrieval.traversal_depth {
            let mut next: BTreeSet<NodeId> = BTreeSet::new();
            for node in frontier {
                if deadline.expired() {
                    return true;
                }
                let Some(record) = self.snapshot.live_node(node) else {
                    continue;
                };
                let weight = best.get(&node).copied().unwrap_or(0.0);
                let reference = anchor.unwrap_or(record.node.context());

                for edge_record in self.snapshot.edges_of(node, Direction::Both) {
                    let edge = &edge_record.edge;
                    let Some((other, other_context)) = edge.other_end(node) else {
                        continue;
                    };
                    if self.snapshot.live_node(other).is_none() {
                        continue;
                    }
                    let hop = weight
                        * effective_strength(edge, decay, self.now)
                        * edge.relevance_from(reference);
                    if hop <= best.get(&other).copied().unwrap_or(0.0) {
                        continue;
                    }
                    best.insert(other, hop);
                    parents.insert(other, (edge.id, node));
                    next.insert(other);

                    // Anchor-context nodes are only stepped through
                    if Some(other_context) != anchor {
                        let candidate = candidates.entry(other).or_default();
                        candidate.proximity = clamp_unit(hop);
                        candidate.via = Some(edge.id);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next.into_iter().collect();
        }
        false
    }

    fn collect_path(
        &self,
        mut node: NodeId,
        parents: &HashMap<NodeId, (EdgeId, NodeId)>,
        out: &mut BTreeSet<EdgeId>,
    ) {
        for _ in 0..self.config.retrieval.traversal_depth {
            let Some((edge, parent)) = parents.get(&node) else {
                return;
            };
            out.insert(*edge);
            node = *parent;
        }
    }

    fn score(
        &self,
        node: &MemoryNode,
        candidate: &Candidate,
        query: &RetrievalQuery,
    ) -> RetrievedMemory {
        let retrieval = &self.config.retrieval;
        let similarity = clamp_unit(
            candidate
                .similarity
                .unwrap_or_else(|| cosine_similarity(&query.embedding, &node.embedding)),
        );
        let relevance = effective_relevance(node, &self.config.decay, self.now);
        let relevance = match query.anchor {
            Some(anchor) if anchor == node.context() => relevance.peak(),
            Some(anchor) => relevance.get(anchor),
            None => relevance.mean(),
        };
        let score = retrieval.alpha * similarity
            + retrieval.beta * candidate.proximity
            + retrieval.gamma * relevance;

        let mut match_reasons = Vec::new();
        if candidate.similarity.is_some() && similarity > 0.0 {
            match_reasons.push(MatchReason::SemanticSimilarity { score: similarity });
        }
        if let Some(edge) = candidate.via {
            match_reasons.push(MatchReason::GraphProximity {
                score: candidate.proximity,
                edge,
            });
        }
        if relevance > 0.0 {
            match_reasons.push(MatchReason::ContextRelevance { score: relevance });
        }

        RetrievedMemory {
            node: node.clone(),
            score: clamp_unit(score),
            similarity,
            proximity: candidate.proximity,
            relevance,
            match_reasons,
        }
    }
}
