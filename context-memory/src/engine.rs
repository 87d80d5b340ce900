//! Memory engine facade
//!
//! Ties the store, inference, reinforcement, retrieval and consolidation
//! together behind the operations callers use: propose a node, retrieve a
//! context package, reinforce what was used, link nodes explicitly, and
//! consolidate.
//!
//! Writes retry `ConflictRetry` and storage failures with exponential
//! backoff. A storage failure that outlasts the retries marks the engine
//! degraded until the next successful write.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::consolidation::{self, ConsolidationScope, Consolidator, MergeReport, SweepReport};
use crate::context::{in_unit_range, MemoryContext};
use crate::embedding::{EmbeddingProvider, VectorEngine};
use crate::error::{MemoryError, Result};
use crate::inference::{edges_for, infer_links, seed_context_relevance};
use crate::node::{MemoryNode, NodeId, NodeProposal};
use crate::relationship::{normalize_label, EdgeId, LabelKey, MemoryEdge, RelationshipType};
use crate::relevance::{reinforce_edge, reinforce_node};
use crate::search::{ContextPackage, MemorySearch, RetrievalQuery};
use crate::storage::{ChangeSet, EdgeWrite, GraphStore, NodeWrite};
use crate::temporal::Lifecycle;

/// What a reinforcement applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReinforceTarget {
    Node(NodeId),
    Edge(EdgeId),
}

impl From<NodeId> for ReinforceTarget {
    fn from(id: NodeId) -> Self {
        Self::Node(id)
    }
}

impl From<EdgeId> for ReinforceTarget {
    fn from(id: EdgeId) -> Self {
        Self::Edge(id)
    }
}

/// Counts over the current snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineStats {
    pub generation: u64,
    pub active: BTreeMap<MemoryContext, usize>,
    pub decayed: BTreeMap<MemoryContext, usize>,
    pub pruned: usize,
    pub merged: usize,
    pub edges: usize,
    pub decayed_edges: usize,
    pub redirects: usize,
    pub registered_types: usize,
    pub pending_labels: usize,
    pub degraded: bool,
}

/// Long-term graph memory
pub struct MemoryEngine {
    store: Arc<GraphStore>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    embedder: Option<Arc<VectorEngine>>,
    degraded: AtomicBool,
}

impl MemoryEngine {
    /// Wrap `store`, validating `config`
    pub fn new(store: GraphStore, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: Arc::new(store),
            config: Arc::new(config),
            clock: Arc::new(SystemClock),
            embedder: None,
            degraded: AtomicBool::new(false),
        })
    }

    /// Open (or create) a RocksDB-backed engine at `path`
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        let engine = Self::new(GraphStore::open(path)?, config)?;
        engine.store.rebuild_index();
        Ok(engine)
    }

    /// Engine over a non-persistent store
    pub fn in_memory(config: EngineConfig) -> Result<Self> {
        Self::new(GraphStore::in_memory(), config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Embed proposals and text queries through `provider`
    pub fn with_embedder(mut self, provider: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if provider.dimension() != self.config.embedding_dimension {
            return Err(MemoryError::validation(format!(
                "embedding provider produces {} dimensions, engine expects {}",
                provider.dimension(),
                self.config.embedding_dimension
            )));
        }
        self.embedder = Some(Arc::new(VectorEngine::with_cache_capacity(
            provider,
            self.config.embedding_cache_capacity,
        )));
        Ok(self)
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Persistence kept failing past the retry ceiling; callers should fall
    /// back to session-only memory
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Store a proposed node and link it to related nodes of the other
    /// contexts. Returns the new id.
    pub async fn propose_node(&self, proposal: NodeProposal) -> Result<NodeId> {
        let now = self.clock.now();
        let mut builder = proposal.into_builder()?.created_at(now);
        if !builder.has_embedding() {
            let embedder = self.embedder.as_ref().ok_or_else(|| {
                MemoryError::validation(
                    "missing required field: embedding (no embedding provider configured)",
                )
            })?;
            let embedding = embedder.embed(&builder.embedding_text())?;
            builder = builder.embedding(embedding);
        }
        let node = builder.build()?;
        node.validate(Some(self.config.embedding_dimension))
            .map_err(MemoryError::Validation)?;

        let id = self.with_retry("put", || self.store.put(node.clone())).await?;
        log::debug!("[engine] stored {} node {}", node.context(), id);
        self.refresh_index_if_lagging();

        let linked = self.link_inferred(&node, now).await?;
        if linked > 0 {
            log::debug!("[engine] node {} linked with {} edges", id, linked);
        }
        Ok(id)
    }

    /// Rebuild the vector index off the async workers once enough nodes
    /// were embedded since the last build
    fn refresh_index_if_lagging(&self) {
        let lag = self.store.index_lag();
        if lag < self.config.index_refresh_lag {
            return;
        }
        log::debug!("[engine] vector index lags by {} nodes, rebuilding", lag);
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || store.try_rebuild_index());
            }
            Err(_) => {
                store.try_rebuild_index();
            }
        }
    }

    async fn link_inferred(&self, node: &MemoryNode, now: DateTime<Utc>) -> Result<usize> {
        let snapshot = self.store.snapshot();
        let index = self.store.vector_index();
        let links = infer_links(&snapshot, index.as_deref(), node, &self.config.inference);

        let mut created = 0;
        for link in &links {
            let Some(target) = snapshot.live_node(link.target) else {
                continue;
            };
            let edges = edges_for(
                node,
                &target.node,
                link,
                &self.config.inference,
                &self.config.decay,
                now,
            );
            let result = self
                .with_retry("link", || {
                    self.store.commit(ChangeSet {
                        edges: edges
                            .iter()
                            .cloned()
                            .map(|edge| EdgeWrite {
                                edge,
                                lifecycle: Lifecycle::Active,
                                expected: None,
                            })
                            .collect(),
                        ..ChangeSet::default()
                    })
                })
                .await;
            match result {
                Ok(_) => created += edges.len(),
                Err(e @ MemoryError::Degraded(_)) => return Err(e),
                Err(e) => {
                    // Target merged or pruned since the snapshot, or held
                    // past the retries
                    log::warn!(
                        "[engine] skipped link {} -> {}: {}",
                        node.id,
                        link.target,
                        e
                    );
                }
            }
        }
        Ok(created)
    }

    /// Link two nodes explicitly.
    ///
    /// A `label` naming a known type sets the edge type. Any other label is
    /// kept on an edge of the pair's canonical type and counted; recurring
    /// labels become new types at consolidation. Linking an already linked
    /// pair reinforces the existing edge instead.
    pub async fn link(
        &self,
        from: NodeId,
        to: NodeId,
        label: Option<&str>,
        strength: f32,
    ) -> Result<EdgeId> {
        if !in_unit_range(strength) {
            return Err(MemoryError::validation(format!(
                "strength out of range [0, 1]: {}",
                strength
            )));
        }
        if let Some(label) = label {
            if normalize_label(label).is_empty() {
                return Err(MemoryError::validation("link label is empty"));
            }
        }
        self.with_retry("link", || self.link_once(from, to, label, strength))
            .await
    }

    fn link_once(
        &self,
        from: NodeId,
        to: NodeId,
        label: Option<&str>,
        strength: f32,
    ) -> Result<EdgeId> {
        let snapshot = self.store.snapshot();
        let endpoint = |id: NodeId| {
            snapshot
                .live_node(id)
                .ok_or_else(|| MemoryError::invalid_reference(format!("endpoint {} does not exist", id)))
        };
        let from_record = endpoint(from)?;
        let to_record = endpoint(to)?;
        let (from_context, to_context) = (from_record.node.context(), to_record.node.context());
        let now = self.clock.now();

        let mut edge = MemoryEdge::new((from, from_context), (to, to_context), strength, now)
            .with_context_relevance(seed_context_relevance(
                &from_record.node,
                &to_record.node,
                &self.config.decay,
                now,
            ));
        let mut labels = Vec::new();
        if let Some(label) = label {
            match snapshot.types().resolve(label, from_context, to_context) {
                Some(rtype) => edge = edge.with_type(rtype),
                None if RelationshipType::from_name(&normalize_label(label)).is_some() => {
                    return Err(MemoryError::validation(format!(
                        "relationship type {} does not connect {} to {}",
                        normalize_label(label),
                        from_context,
                        to_context
                    )));
                }
                None => {
                    let key = LabelKey {
                        label: normalize_label(label),
                        from_context,
                        to_context,
                    };
                    let count = snapshot.label_count(&key).saturating_add(1);
                    labels.push((key, count));
                    edge = edge.with_label(label);
                }
            }
        }

        if let Some(existing) = snapshot.edge_by_key(&edge.key()) {
            let mut reinforced = existing.edge.clone();
            let lifecycle = reinforce_edge(
                &mut reinforced,
                existing.lifecycle,
                &self.config.decay,
                &self.config.reinforcement,
                now,
            );
            // An unlabelled edge takes the label; a labelled one keeps its own
            if reinforced.label.is_none() && edge.label.is_some() {
                reinforced.label = edge.label;
            } else {
                labels.clear();
            }
            let id = reinforced.id;
            self.store.commit(ChangeSet {
                edges: vec![EdgeWrite {
                    edge: reinforced,
                    lifecycle,
                    expected: Some(existing.version),
                }],
                labels,
                ..ChangeSet::default()
            })?;
            return Ok(id);
        }

        let id = edge.id;
        self.store.commit(ChangeSet {
            edges: vec![EdgeWrite {
                edge,
                lifecycle: Lifecycle::Active,
                expected: None,
            }],
            labels,
            ..ChangeSet::default()
        })?;
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Ranked context package for `query`, read from one snapshot
    pub fn retrieve(&self, query: RetrievalQuery) -> Result<ContextPackage> {
        if query.embedding.len() != self.config.embedding_dimension {
            return Err(MemoryError::validation(format!(
                "query embedding has {} dimensions, expected {}",
                query.embedding.len(),
                self.config.embedding_dimension
            )));
        }
        if query.embedding.iter().any(|x| !x.is_finite()) {
            return Err(MemoryError::validation("query embedding contains non-finite values"));
        }

        let snapshot = self.store.snapshot();
        let index = self.store.vector_index();
        let search = MemorySearch::new(&snapshot, index.as_deref(), &self.config, self.clock.now());
        Ok(search.retrieve(&query))
    }

    /// [`retrieve`](Self::retrieve) with the query text embedded by the
    /// configured provider
    pub fn retrieve_text(
        &self,
        text: &str,
        anchor: Option<MemoryContext>,
        budget: Option<Duration>,
    ) -> Result<ContextPackage> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| MemoryError::embedding("no embedding provider configured"))?;
        self.retrieve(RetrievalQuery {
            embedding: embedder.embed(text)?,
            text: Some(text.to_string()),
            anchor,
            budget,
        })
    }

    pub fn get(&self, id: NodeId) -> Result<MemoryNode> {
        self.store.get(id)
    }

    /// Follow merge redirects to the surviving node
    pub fn resolve(&self, id: NodeId) -> Result<NodeId> {
        self.store.resolve(id)
    }

    // ------------------------------------------------------------------
    // Reinforcement
    // ------------------------------------------------------------------

    /// Record that a node or edge was used in a response.
    ///
    /// Fails with `StaleReference` for pruned or merged nodes; the error
    /// names the survivor while its merge redirect is kept.
    pub async fn reinforce(&self, target: impl Into<ReinforceTarget>) -> Result<()> {
        match target.into() {
            ReinforceTarget::Node(id) => {
                self.with_retry("reinforce", || self.reinforce_node_once(id))
                    .await
            }
            ReinforceTarget::Edge(id) => {
                self.with_retry("reinforce", || self.reinforce_edge_once(id))
                    .await
            }
        }
    }

    fn reinforce_node_once(&self, id: NodeId) -> Result<()> {
        let snapshot = self.store.snapshot();
        let record = snapshot.node(id).ok_or_else(|| MemoryError::not_found(id))?;
        match record.lifecycle {
            Lifecycle::Pruned { .. } => return Err(MemoryError::stale(id, None)),
            Lifecycle::Merged { .. } => {
                return Err(MemoryError::stale(id, snapshot.resolve(id).ok()))
            }
            Lifecycle::Active | Lifecycle::Decayed { .. } => {}
        }

        let mut node = record.node.clone();
        let lifecycle = reinforce_node(
            &mut node,
            record.lifecycle,
            &self.config.decay,
            &self.config.reinforcement,
            self.clock.now(),
        );
        if record.lifecycle.is_decayed() && lifecycle.is_active() {
            log::info!("[engine] node {} revived by reinforcement", id);
        }
        self.store.commit(ChangeSet {
            nodes: vec![NodeWrite {
                node,
                lifecycle,
                expected: Some(record.version),
            }],
            ..ChangeSet::default()
        })?;
        Ok(())
    }

    fn reinforce_edge_once(&self, id: EdgeId) -> Result<()> {
        let snapshot = self.store.snapshot();
        let record = snapshot.edge(id).ok_or_else(|| MemoryError::not_found(id))?;
        let mut edge = record.edge.clone();
        let lifecycle = reinforce_edge(
            &mut edge,
            record.lifecycle,
            &self.config.decay,
            &self.config.reinforcement,
            self.clock.now(),
        );
        self.store.commit(ChangeSet {
            edges: vec![EdgeWrite {
                edge,
                lifecycle,
                expected: Some(record.version),
            }],
            ..ChangeSet::default()
        })?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Merge, prune and register new types. Runs on the blocking pool.
    pub async fn run_consolidation(&self, scope: ConsolidationScope) -> Result<MergeReport> {
        let store = self.store.clone();
        let config = self.config.clone();
        let now = self.clock.now();
        let result = tokio::task::spawn_blocking(move || {
            Consolidator::new(&store, &config, now).run(scope)
        })
        .await
        .map_err(|e| MemoryError::Io(std::io::Error::other(e)))?;
        self.observe(result)
    }

    /// Materialise decay and apply lifecycle transitions only
    pub async fn sweep_decay(&self, scope: ConsolidationScope) -> Result<SweepReport> {
        let store = self.store.clone();
        let config = self.config.clone();
        let now = self.clock.now();
        let result = tokio::task::spawn_blocking(move || {
            consolidation::sweep_decay(&store, &config, now, scope)
        })
        .await
        .map_err(|e| MemoryError::Io(std::io::Error::other(e)))?;
        self.observe(result)
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.store.snapshot();
        let mut stats = EngineStats {
            generation: snapshot.generation(),
            redirects: snapshot.redirects().count(),
            registered_types: snapshot.types().len(),
            pending_labels: snapshot.pending_labels().count(),
            degraded: self.is_degraded(),
            ..EngineStats::default()
        };
        for record in snapshot.nodes() {
            let context = record.node.context();
            match record.lifecycle {
                Lifecycle::Active => *stats.active.entry(context).or_default() += 1,
                Lifecycle::Decayed { .. } => *stats.decayed.entry(context).or_default() += 1,
                Lifecycle::Pruned { .. } => stats.pruned += 1,
                Lifecycle::Merged { .. } => stats.merged += 1,
            }
        }
        for record in snapshot.edges() {
            stats.edges += 1;
            if record.lifecycle.is_decayed() {
                stats.decayed_edges += 1;
            }
        }
        stats
    }

    // ------------------------------------------------------------------
    // Retry and health
    // ------------------------------------------------------------------

    /// Run `op` until it succeeds, fails permanently, or runs out of
    /// attempts. Storage failures past the ceiling mark the engine degraded.
    async fn with_retry<T>(&self, operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let retry = &self.config.retry;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    self.mark_healthy();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    log::debug!(
                        "[engine] {} attempt {} failed ({}), retrying in {:?}",
                        operation,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_storage() => {
                    self.mark_degraded(operation, &e);
                    return Err(MemoryError::Degraded(format!(
                        "{} failed after {} attempts: {}",
                        operation, attempt, e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.mark_healthy(),
            Err(e) if e.is_storage() => self.mark_degraded("consolidation", e),
            Err(_) => {}
        }
        result
    }

    fn mark_degraded(&self, operation: &str, error: &MemoryError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            log::error!(
                "[engine] persistence failing ({} : {}); engine degraded",
                operation,
                error
            );
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            log::info!("[engine] persistence recovered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{DecayConfig, RetryConfig};
    use crate::embedding::HashingEmbedding;
    use crate::node::{
        CurrentDetails, ExperienceDetails, KnowledgeDetails, NodeDetails, RelationshipDetails,
    };
    use crate::storage::Direction;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    const DIM: usize = 3;

    fn config() -> EngineConfig {
        EngineConfig {
            retry: RetryConfig {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                ..RetryConfig::default()
            },
            ..EngineConfig::default().with_dimension(DIM)
        }
    }

    fn engine() -> MemoryEngine {
        MemoryEngine::in_memory(config()).unwrap()
    }

    fn experience_details(event: &str, participants: &[&str]) -> NodeDetails {
        NodeDetails::Experience(ExperienceDetails {
            event_type: event.into(),
            participants: participants.iter().map(|p| p.to_string()).collect(),
            lessons_learned: vec![],
            location: None,
            insights: vec![],
        })
    }

    fn knowledge_details(concept: &str) -> NodeDetails {
        NodeDetails::Knowledge(KnowledgeDetails {
            concept: concept.into(),
            definition: format!("{} in practice", concept),
            how_to_use: vec![],
            understanding_level: 0.5,
            category: None,
            related_concepts: Default::default(),
        })
    }

    fn relationship_details(person: &str, trust: f32) -> NodeDetails {
        NodeDetails::Relationship(RelationshipDetails {
            person_ref: person.into(),
            relationship_type: "colleague".into(),
            trust_level: trust,
            personality_traits: Default::default(),
            interests: Default::default(),
        })
    }

    fn current_details(focus: &str) -> NodeDetails {
        NodeDetails::Current(CurrentDetails {
            focus: focus.into(),
            time_context: "today".into(),
            mood: 0.0,
            stress_level: 0.4,
            recent_experience_refs: vec![],
            goals: vec![],
        })
    }

    struct ScenarioA {
        experience: NodeId,
        knowledge: NodeId,
        relationship: NodeId,
    }

    async fn scenario_a(engine: &MemoryEngine) -> ScenarioA {
        let experience = engine
            .propose_node(
                NodeProposal::new(
                    experience_details("presentation", &["John"]),
                    "John helped with presentation",
                )
                .with_embedding(vec![0.8, 0.5, 0.3])
                .with_relevance(MemoryContext::Knowledge, 0.8)
                .with_relevance(MemoryContext::Relationship, 0.9)
                .with_emotional_weight(0.7),
            )
            .await
            .unwrap();
        let knowledge = engine
            .propose_node(
                NodeProposal::new(knowledge_details("Python debugging"), "Python debugging")
                    .with_embedding(vec![0.6, 0.8, 0.0]),
            )
            .await
            .unwrap();
        let relationship = engine
            .propose_node(
                NodeProposal::new(relationship_details("John", 0.9), "John, colleague")
                    .with_embedding(vec![0.9, 0.2, 0.3])
                    .with_emotional_weight(0.6),
            )
            .await
            .unwrap();
        ScenarioA {
            experience,
            knowledge,
            relationship,
        }
    }

    fn edge_between(engine: &MemoryEngine, from: NodeId, to: NodeId) -> Option<MemoryEdge> {
        engine
            .store()
            .get_edges_between(from, Direction::Outgoing)
            .unwrap()
            .into_iter()
            .find(|e| e.to_id == to)
    }

    #[tokio::test]
    async fn test_scenario_a_inference_links_across_contexts() {
        let engine = engine();
        let ids = scenario_a(&engine).await;
        let threshold = engine.config().inference.similarity_threshold;

        for (a, b) in [
            (ids.experience, ids.knowledge),
            (ids.knowledge, ids.experience),
            (ids.experience, ids.relationship),
            (ids.relationship, ids.experience),
        ] {
            let edge = edge_between(&engine, a, b).expect("missing inferred edge");
            assert!(edge.strength > threshold, "weak edge {}", edge.strength);
        }
        let edge = edge_between(&engine, ids.experience, ids.relationship).unwrap();
        assert_eq!(edge.relationship_type, RelationshipType::ExperienceToRelationship);
    }

    #[tokio::test]
    async fn test_scenario_b_retrieval_prefers_current_relevance() {
        let engine = engine();
        let ids = scenario_a(&engine).await;

        // Same embeddings as the scenario nodes, little relevance to Current
        let unrelated_experience = engine
            .propose_node(
                NodeProposal::new(experience_details("birthday", &[]), "cake in the office")
                    .with_embedding(vec![0.8, 0.5, 0.3])
                    .with_relevance(MemoryContext::Current, 0.1),
            )
            .await
            .unwrap();
        let unrelated_relationship = engine
            .propose_node(
                NodeProposal::new(relationship_details("Mara", 0.3), "Mara, neighbour")
                    .with_embedding(vec![0.9, 0.2, 0.3])
                    .with_relevance(MemoryContext::Current, 0.1),
            )
            .await
            .unwrap();
        engine
            .propose_node(
                NodeProposal::new(current_details("presentation"), "need help with presentation")
                    .with_embedding(vec![0.85, 0.4, 0.3]),
            )
            .await
            .unwrap();

        let package = engine
            .retrieve(
                RetrievalQuery::new(vec![0.85, 0.4, 0.3])
                    .text("need help with presentation")
                    .anchor(MemoryContext::Current),
            )
            .unwrap();
        assert!(!package.truncated);

        let position = |list: &[crate::search::RetrievedMemory], id: NodeId| {
            list.iter().position(|m| m.node.id == id).unwrap()
        };
        assert!(
            position(&package.experience, ids.experience)
                < position(&package.experience, unrelated_experience)
        );
        assert!(
            position(&package.relationship, ids.relationship)
                < position(&package.relationship, unrelated_relationship)
        );
        assert!(!package.justifying_edges.is_empty());
    }

    #[tokio::test]
    async fn test_scenario_c_decay_then_tombstone() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut cfg = config();
        cfg.decay = DecayConfig::uniform(0.1);
        let engine = MemoryEngine::in_memory(cfg).unwrap().with_clock(clock.clone());

        let id = engine
            .propose_node(
                NodeProposal::new(experience_details("offsite", &[]), "team offsite")
                    .with_embedding(vec![1.0, 0.0, 0.0])
                    .with_relevance(MemoryContext::Knowledge, 0.9)
                    .with_relevance(MemoryContext::Relationship, 0.9)
                    .with_relevance(MemoryContext::Current, 0.9),
            )
            .await
            .unwrap();

        clock.advance(ChronoDuration::days(30));
        let report = engine.run_consolidation(ConsolidationScope::All).await.unwrap();
        assert_eq!(report.decayed, 1);
        assert_eq!(report.pruned, 0);
        assert!(engine.get(id).is_ok());
        assert_eq!(engine.stats().decayed[&MemoryContext::Experience], 1);

        clock.advance(ChronoDuration::days(7));
        let report = engine.run_consolidation(ConsolidationScope::All).await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(matches!(engine.get(id), Err(MemoryError::NotFound(_))));
        assert!(matches!(
            engine.reinforce(id).await,
            Err(MemoryError::StaleReference { redirect: None, .. })
        ));
        let package = engine
            .retrieve(RetrievalQuery::new(vec![1.0, 0.0, 0.0]))
            .unwrap();
        assert!(!package.contains(id));
    }

    #[tokio::test]
    async fn test_scenario_d_merge_redirects_edges() {
        let engine = engine();
        let exp = engine
            .propose_node(
                NodeProposal::new(experience_details("workshop", &[]), "python workshop")
                    .with_embedding(vec![0.7, 0.7, 0.1]),
            )
            .await
            .unwrap();
        let first = engine
            .propose_node(
                NodeProposal::new(knowledge_details("Python"), "Python basics")
                    .with_embedding(vec![0.6, 0.8, 0.0])
                    .with_relevance(MemoryContext::Experience, 0.9),
            )
            .await
            .unwrap();
        let second = engine
            .propose_node(
                NodeProposal::new(knowledge_details("python"), "Python syntax")
                    .with_embedding(vec![0.61, 0.79, 0.0]),
            )
            .await
            .unwrap();
        assert!(edge_between(&engine, exp, first).is_some());
        assert!(edge_between(&engine, exp, second).is_some());

        let report = engine.run_consolidation(ConsolidationScope::All).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(engine.resolve(second).unwrap(), first);
        assert!(matches!(
            engine.reinforce(second).await,
            Err(MemoryError::StaleReference { redirect: Some(to), .. }) if to == first
        ));

        let edges = engine
            .store()
            .get_edges_between(first, Direction::Both)
            .unwrap();
        let mut keys: Vec<_> = edges.iter().map(|e| e.key()).collect();
        keys.sort_by_key(|k| (k.from_id, k.to_id, k.relationship_type.name()));
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len(), "parallel edges of the same type remain");
        assert!(edges.iter().all(|e| e.from_id != second && e.to_id != second));
        assert!(edge_between(&engine, exp, first).is_some());

        let again = engine.run_consolidation(ConsolidationScope::All).await.unwrap();
        assert_eq!(again.merged, 0);
        assert_eq!(again.pruned, 0);
    }

    #[tokio::test]
    async fn test_roundtrip_every_variant_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let now = Utc::now();
        let nodes = vec![
            MemoryNode::builder()
                .details(NodeDetails::Experience(ExperienceDetails {
                    event_type: "conference".into(),
                    participants: ["john".to_string(), "mara".to_string()].into(),
                    lessons_learned: vec!["arrive early".into(), "bring water".into()],
                    location: Some("Berlin".into()),
                    insights: vec!["talks are recorded".into()],
                }))
                .content("RustConf trip")
                .emotional_weight(0.4)
                .relevance(MemoryContext::Knowledge, 0.7)
                .tag("travel")
                .created_at(now)
                .embedding(vec![0.1, 0.2, 0.3])
                .build()
                .unwrap(),
            MemoryNode::builder()
                .details(NodeDetails::Knowledge(KnowledgeDetails {
                    concept: "borrow checker".into(),
                    definition: "enforces aliasing rules".into(),
                    how_to_use: vec!["read the error".into()],
                    understanding_level: 0.6,
                    category: Some("rust".into()),
                    related_concepts: ["lifetimes".to_string()].into(),
                }))
                .content("ownership notes")
                .created_at(now)
                .embedding(vec![0.3, 0.2, 0.1])
                .build()
                .unwrap(),
            MemoryNode::builder()
                .details(NodeDetails::Relationship(RelationshipDetails {
                    person_ref: "John".into(),
                    relationship_type: "mentor".into(),
                    trust_level: 0.95,
                    personality_traits: ["patient".to_string()].into(),
                    interests: ["chess".to_string()].into(),
                }))
                .content("John mentors me")
                .created_at(now)
                .embedding(vec![0.0, 1.0, 0.0])
                .build()
                .unwrap(),
            MemoryNode::builder()
                .details(NodeDetails::Current(CurrentDetails {
                    focus: "release".into(),
                    time_context: "this sprint".into(),
                    mood: -0.3,
                    stress_level: 0.7,
                    recent_experience_refs: vec![NodeId::new()],
                    goals: vec!["ship 1.0".into()],
                }))
                .content("shipping the release")
                .created_at(now)
                .embedding(vec![1.0, 0.0, 0.0])
                .build()
                .unwrap(),
        ];

        {
            let engine = MemoryEngine::open(temp_dir.path(), config()).unwrap();
            for node in &nodes {
                engine.store().put(node.clone()).unwrap();
                assert_eq!(&engine.get(node.id).unwrap(), node);
            }
        }

        let engine = MemoryEngine::open(temp_dir.path(), config()).unwrap();
        for node in &nodes {
            assert_eq!(&engine.get(node.id).unwrap(), node);
        }
    }

    #[tokio::test]
    async fn test_reinforcement_diminishes_and_stays_in_range() {
        let engine = engine();
        let id = engine
            .propose_node(
                NodeProposal::new(knowledge_details("tokio"), "async runtime")
                    .with_embedding(vec![1.0, 0.0, 0.0])
                    .with_relevance(MemoryContext::Current, 0.5),
            )
            .await
            .unwrap();

        let mut last = engine.get(id).unwrap().relevance.get(MemoryContext::Current);
        let mut last_gain = f32::INFINITY;
        for _ in 0..10 {
            engine.reinforce(id).await.unwrap();
            let now = engine.get(id).unwrap().relevance.get(MemoryContext::Current);
            let gain = now - last;
            assert!(now <= 1.0);
            assert!(gain <= last_gain + 1e-6);
            last_gain = gain;
            last = now;
        }
        assert_eq!(engine.get(id).unwrap().reinforcement_count, 10);
    }

    #[tokio::test]
    async fn test_reinforce_edge() {
        let engine = engine();
        let ids = scenario_a(&engine).await;
        let edge = edge_between(&engine, ids.experience, ids.knowledge).unwrap();
        engine.reinforce(edge.id).await.unwrap();
        let record = engine.store().get_edge(edge.id).unwrap();
        assert_eq!(record.edge.reinforcement_count, 1);
        assert!(record.edge.strength >= edge.strength);
    }

    #[tokio::test]
    async fn test_propose_rejects_bad_input() {
        let engine = engine();
        // No embedding and no provider
        let err = engine
            .propose_node(NodeProposal::new(knowledge_details("serde"), "serialization"))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = engine
            .propose_node(
                NodeProposal::new(knowledge_details("serde"), "serialization")
                    .with_embedding(vec![1.0, 0.0]),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = engine
            .propose_node(
                NodeProposal::new(knowledge_details("serde"), "serialization")
                    .with_embedding(vec![1.0, 0.0, 0.0])
                    .with_emotional_weight(1.5),
            )
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(engine.stats().generation, 0);
    }

    #[tokio::test]
    async fn test_propose_embeds_content_with_provider() {
        let engine = engine()
            .with_embedder(Arc::new(HashingEmbedding::new(DIM).unwrap()))
            .unwrap();
        let id = engine
            .propose_node(NodeProposal::new(knowledge_details("serde"), "serialization"))
            .await
            .unwrap();
        assert_eq!(engine.get(id).unwrap().embedding.len(), DIM);

        let package = engine.retrieve_text("serde serialization", None, None).unwrap();
        assert!(package.contains(id));
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_then_recovers() {
        let engine = engine();
        let attempts = engine.config().retry.max_attempts;
        engine.store().fail_next_writes(attempts);

        let proposal = NodeProposal::new(knowledge_details("disk"), "disk full")
            .with_embedding(vec![1.0, 0.0, 0.0]);
        let err = engine.propose_node(proposal.clone()).await.unwrap_err();
        assert!(matches!(err, MemoryError::Degraded(_)));
        assert!(engine.is_degraded());
        assert!(engine.stats().degraded);
        // Nothing half-written
        assert_eq!(engine.stats().generation, 0);

        engine.propose_node(proposal).await.unwrap();
        assert!(!engine.is_degraded());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let engine = engine();
        engine.store().fail_next_writes(2);
        let id = engine
            .propose_node(
                NodeProposal::new(knowledge_details("retry"), "backoff")
                    .with_embedding(vec![1.0, 0.0, 0.0]),
            )
            .await
            .unwrap();
        assert!(engine.get(id).is_ok());
        assert!(!engine.is_degraded());
    }

    #[tokio::test]
    async fn test_link_counts_unknown_labels_and_registers_type() {
        let engine = engine();
        let axes = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mut pairs = Vec::new();
        for (i, axis) in axes.iter().enumerate() {
            let exp = engine
                .propose_node(
                    NodeProposal::new(experience_details(&format!("talk {}", i), &[]), "a talk")
                        .with_embedding(axis.to_vec()),
                )
                .await
                .unwrap();
            let person = engine
                .propose_node(
                    NodeProposal::new(relationship_details(&format!("speaker {}", i), 0.5), "a speaker")
                        .with_embedding(axis.to_vec()),
                )
                .await
                .unwrap();
            pairs.push((exp, person));
        }

        // Each pair already has an inferred edge; the label lands on it
        let mut edges = Vec::new();
        for (exp, person) in &pairs {
            let inferred = edge_between(&engine, *exp, *person).unwrap();
            let id = engine.link(*exp, *person, Some("inspired by"), 0.6).await.unwrap();
            assert_eq!(id, inferred.id);
            edges.push(id);
        }
        let key = LabelKey {
            label: "INSPIRED_BY".into(),
            from_context: MemoryContext::Experience,
            to_context: MemoryContext::Relationship,
        };
        assert_eq!(engine.store().snapshot().label_count(&key), 3);

        let report = engine.run_consolidation(ConsolidationScope::All).await.unwrap();
        assert_eq!(report.new_types, vec!["INSPIRED_BY".to_string()]);
        for id in &edges {
            assert_eq!(
                engine.store().get_edge(*id).unwrap().edge.relationship_type,
                RelationshipType::Registered("INSPIRED_BY".into())
            );
        }
        assert_eq!(engine.store().snapshot().label_count(&key), 0);
        assert_eq!(engine.stats().registered_types, 1);

        // The label now resolves to the registered type
        let (exp, person) = pairs[0];
        assert_eq!(
            engine.link(exp, person, Some("inspired by"), 0.5).await.unwrap(),
            edges[0]
        );
        assert_eq!(engine.store().snapshot().label_count(&key), 0);
    }

    #[tokio::test]
    async fn test_link_validates_endpoints_and_types() {
        let engine = engine();
        let a = engine
            .propose_node(
                NodeProposal::new(knowledge_details("a"), "a").with_embedding(vec![1.0, 0.0, 0.0]),
            )
            .await
            .unwrap();
        let b = engine
            .propose_node(
                NodeProposal::new(knowledge_details("b"), "b").with_embedding(vec![0.0, 1.0, 0.0]),
            )
            .await
            .unwrap();

        assert!(matches!(
            engine.link(a, NodeId::new(), None, 0.5).await,
            Err(MemoryError::InvalidReference(_))
        ));
        assert!(engine
            .link(a, b, Some("EXPERIENCE_TO_KNOWLEDGE"), 0.5)
            .await
            .unwrap_err()
            .is_validation());
        assert!(engine.link(a, a, None, 0.5).await.unwrap_err().is_validation());
        assert!(engine.link(a, b, None, 1.5).await.unwrap_err().is_validation());

        let id = engine.link(a, b, None, 0.5).await.unwrap();
        assert_eq!(
            engine.store().get_edge(id).unwrap().edge.relationship_type,
            RelationshipType::KnowledgeHierarchy
        );
        // Linking again reinforces the same edge
        assert_eq!(engine.link(a, b, None, 0.5).await.unwrap(), id);
        assert_eq!(engine.store().get_edge(id).unwrap().edge.reinforcement_count, 1);
    }

    #[tokio::test]
    async fn test_retrieve_rejects_wrong_dimension() {
        let engine = engine();
        assert!(engine
            .retrieve(RetrievalQuery::new(vec![1.0, 0.0]))
            .unwrap_err()
            .is_validation());
        assert!(matches!(
            engine.retrieve_text("anything", None, None),
            Err(MemoryError::Embedding(_))
        ));
    }

    #[test]
    fn test_reinforce_unknown_target_is_not_found() {
        let engine = engine();
        let result = tokio_test::block_on(engine.reinforce(NodeId::new()));
        assert!(matches!(result, Err(MemoryError::NotFound(_))));
        let result = tokio_test::block_on(engine.reinforce(EdgeId::new()));
        assert!(matches!(result, Err(MemoryError::NotFound(_))));
        // Permanent failures do not touch the health flag
        assert!(!engine.is_degraded());
    }

    #[tokio::test]
    async fn test_lagging_index_is_rebuilt_in_background() {
        let engine = MemoryEngine::in_memory(EngineConfig {
            index_refresh_lag: 2,
            ..config()
        })
        .unwrap();
        let first = engine
            .propose_node(
                NodeProposal::new(knowledge_details("rust"), "rust ownership")
                    .with_embedding(vec![1.0, 0.0, 0.0]),
            )
            .await
            .unwrap();
        assert!(engine.store.vector_index().is_none());

        let second = engine
            .propose_node(
                NodeProposal::new(knowledge_details("tokio"), "tokio runtime")
                    .with_embedding(vec![0.0, 1.0, 0.0]),
            )
            .await
            .unwrap();

        let mut index = None;
        for _ in 0..200 {
            index = engine.store.vector_index();
            if index.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let index = index.expect("background rebuild never finished");
        assert!(index.generation() >= 2);
        assert_eq!(
            index.search(MemoryContext::Knowledge, &[0.0, 1.0, 0.0], 1),
            vec![second]
        );
        assert_ne!(second, first);
        assert_eq!(engine.store.index_lag(), 0);
    }
}
