//! Background consolidation
//!
//! One run, in order:
//!   1. Decay sweep    – materialise lazy decay, Active → Decayed transitions
//!   2. Merge          – fold near-duplicate nodes of a context into a survivor
//!   3. Prune          – tombstone nodes and drop edges Decayed past retention,
//!                       expire old merge redirects
//!   4. Schema         – register recurring unknown link labels as types
//!   5. Index rebuild  – fresh HNSW index for the consolidated graph
//!
//! Each merge cluster commits atomically under a lock on the cluster and its
//! direct neighbours. A failed cluster is rolled back and reported; the rest
//! of the run continues. Re-running at the same instant changes nothing.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::context::MemoryContext;
use crate::engine::MemoryEngine;
use crate::error::{MemoryError, Result};
use crate::index::cosine_similarity;
use crate::node::{MemoryNode, NodeDetails, NodeId};
use crate::relationship::{normalize_label, EdgeKey, MemoryEdge, RegisteredType, RelationshipType};
use crate::relevance::{
    edge_lifecycle, effective_relevance, effective_strength, materialize_edge, materialize_node,
    node_lifecycle,
};
use crate::storage::{ChangeSet, Direction, EdgeWrite, GraphSnapshot, GraphStore, NodeWrite};
use crate::temporal::{Lifecycle, MergeRedirect};

/// Writes per sweep commit
const SWEEP_BATCH_SIZE: usize = 256;

/// Which part of the graph a run touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsolidationScope {
    #[default]
    All,
    Context(MemoryContext),
}

impl ConsolidationScope {
    pub fn includes(&self, context: MemoryContext) -> bool {
        match self {
            Self::All => true,
            Self::Context(c) => *c == context,
        }
    }

    fn contexts(&self) -> Vec<MemoryContext> {
        match self {
            Self::All => MemoryContext::ALL.to_vec(),
            Self::Context(c) => vec![*c],
        }
    }
}

/// Outcome of a decay sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Nodes whose decayed relevance was written back
    pub nodes_updated: usize,
    /// Nodes that became Decayed
    pub nodes_decayed: usize,
    pub edges_updated: usize,
    pub edges_decayed: usize,
    /// Writes skipped because of a concurrent update or lock
    pub conflicts: usize,
}

/// Outcome of a consolidation run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    /// Nodes folded into a survivor
    pub merged: usize,
    /// Nodes tombstoned
    pub pruned: usize,
    /// Edges deleted (decayed past retention or attached to pruned nodes)
    pub edges_pruned: usize,
    /// Nodes that became Decayed during the sweep
    pub decayed: usize,
    pub redirects_expired: usize,
    /// Relationship types registered by schema evolution
    pub new_types: Vec<String>,
    /// Nodes of merge clusters that were rolled back
    pub failed_ids: Vec<NodeId>,
}

impl MergeReport {
    /// Nothing merged, pruned, registered or expired
    pub fn is_noop(&self) -> bool {
        self.merged == 0
            && self.pruned == 0
            && self.edges_pruned == 0
            && self.redirects_expired == 0
            && self.new_types.is_empty()
            && self.failed_ids.is_empty()
    }
}

impl std::fmt::Display for MergeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "merged={} pruned={} edges_pruned={} decayed={} redirects_expired={} new_types={:?} failed={}",
            self.merged,
            self.pruned,
            self.edges_pruned,
            self.decayed,
            self.redirects_expired,
            self.new_types,
            self.failed_ids.len()
        )
    }
}

/// Near-duplicates to fold into `survivor`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCluster {
    pub survivor: NodeId,
    pub merged: Vec<NodeId>,
}

impl MergeCluster {
    pub fn ids(&self) -> Vec<NodeId> {
        std::iter::once(self.survivor)
            .chain(self.merged.iter().copied())
            .collect()
    }
}

/// Materialise decay and apply Active → Decayed transitions
pub fn sweep_decay(
    store: &GraphStore,
    config: &EngineConfig,
    now: DateTime<Utc>,
    scope: ConsolidationScope,
) -> Result<SweepReport> {
    let snapshot = store.snapshot();
    let decay = &config.decay;
    let mut report = SweepReport::default();

    let mut node_writes = Vec::new();
    for record in snapshot
        .live_nodes()
        .filter(|r| scope.includes(r.node.context()))
    {
        let lifecycle = node_lifecycle(&record.node, record.lifecycle, decay, now);
        let mut node = record.node.clone();
        materialize_node(&mut node, decay, now);
        if node == record.node && lifecycle == record.lifecycle {
            continue;
        }
        node_writes.push(NodeWrite {
            node,
            lifecycle,
            expected: Some(record.version),
        });
    }

    let mut edge_writes = Vec::new();
    for record in snapshot
        .edges()
        .filter(|r| scope.includes(r.edge.from_context))
    {
        let lifecycle = edge_lifecycle(&record.edge, record.lifecycle, decay, now);
        let mut edge = record.edge.clone();
        materialize_edge(&mut edge, decay, now);
        if edge == record.edge && lifecycle == record.lifecycle {
            continue;
        }
        edge_writes.push(EdgeWrite {
            edge,
            lifecycle,
            expected: Some(record.version),
        });
    }

    let newly_decayed = |lifecycle: &Lifecycle, id: NodeId| {
        lifecycle.is_decayed() && snapshot.node(id).is_some_and(|r| !r.lifecycle.is_decayed())
    };

    for write in commit_in_batches(store, node_writes, |nodes| ChangeSet {
        nodes,
        ..ChangeSet::default()
    }, &mut report.conflicts)?
    {
        report.nodes_updated += 1;
        if newly_decayed(&write.lifecycle, write.node.id) {
            report.nodes_decayed += 1;
        }
    }

    for write in commit_in_batches(store, edge_writes, |edges| ChangeSet {
        edges,
        ..ChangeSet::default()
    }, &mut report.conflicts)?
    {
        report.edges_updated += 1;
        let was_decayed = snapshot
            .edge(write.edge.id)
            .is_some_and(|r| r.lifecycle.is_decayed());
        if write.lifecycle.is_decayed() && !was_decayed {
            report.edges_decayed += 1;
        }
    }

    if report.nodes_decayed > 0 || report.edges_decayed > 0 {
        log::info!(
            "[consolidation] sweep: {} nodes and {} edges decayed",
            report.nodes_decayed,
            report.edges_decayed
        );
    }
    Ok(report)
}

/// Commit `writes` in batches. A batch that conflicts is retried one write
/// at a time and the conflicting writes are skipped. Returns what landed.
fn commit_in_batches<T: Clone>(
    store: &GraphStore,
    writes: Vec<T>,
    to_changes: impl Fn(Vec<T>) -> ChangeSet,
    conflicts: &mut usize,
) -> Result<Vec<T>> {
    let mut applied = Vec::with_capacity(writes.len());
    for chunk in writes.chunks(SWEEP_BATCH_SIZE) {
        match store.commit(to_changes(chunk.to_vec())) {
            Ok(_) => applied.extend_from_slice(chunk),
            Err(MemoryError::ConflictRetry(_)) => {
                for write in chunk {
                    match store.commit(to_changes(vec![write.clone()])) {
                        Ok(_) => applied.push(write.clone()),
                        Err(MemoryError::ConflictRetry(reason)) => {
                            log::debug!("[consolidation] sweep skipped a write: {}", reason);
                            *conflicts += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(applied)
}

/// Group near-duplicate live nodes of `context`.
///
/// Nodes are visited by aggregate relevance, highest first; each unassigned
/// node absorbs every later unassigned node whose similarity to it exceeds
/// `merge_threshold`.
pub fn find_clusters(
    snapshot: &GraphSnapshot,
    context: MemoryContext,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Vec<MergeCluster> {
    let mut candidates: Vec<(&MemoryNode, f32)> = snapshot
        .live_nodes_in(context)
        .map(|r| (&r.node, effective_relevance(&r.node, &config.decay, now).mean()))
        .collect();
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.created_at.cmp(&b.0.created_at))
            .then_with(|| a.0.id.cmp(&b.0.id))
    });

    let threshold = config.consolidation.merge_threshold;
    let mut assigned: HashSet<NodeId> = HashSet::new();
    let mut clusters = Vec::new();

    for (i, (survivor, _)) in candidates.iter().enumerate() {
        if assigned.contains(&survivor.id) {
            continue;
        }
        let merged: Vec<NodeId> = candidates[i + 1..]
            .iter()
            .filter(|(other, _)| !assigned.contains(&other.id))
            .filter(|(other, _)| cosine_similarity(&survivor.embedding, &other.embedding) > threshold)
            .map(|(other, _)| other.id)
            .collect();
        if merged.is_empty() {
            continue;
        }
        assigned.insert(survivor.id);
        assigned.extend(merged.iter().copied());
        clusters.push(MergeCluster {
            survivor: survivor.id,
            merged,
        });
    }
    clusters
}

/// Writes that fold `cluster` into its survivor.
///
/// Edges of merged nodes are moved onto the survivor; self-loops are
/// dropped and parallel edges of the same type keep only the strongest.
pub fn plan_merge(
    snapshot: &GraphSnapshot,
    cluster: &MergeCluster,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> Result<ChangeSet> {
    let decay = &config.decay;
    let survivor_record = snapshot
        .live_node(cluster.survivor)
        .ok_or_else(|| MemoryError::conflict(format!("survivor {} is no longer live", cluster.survivor)))?;

    let mut survivor = survivor_record.node.clone();
    materialize_node(&mut survivor, decay, now);
    let mut changes = ChangeSet::default();

    let merged: BTreeSet<NodeId> = cluster.merged.iter().copied().collect();
    for id in &merged {
        let record = snapshot
            .live_node(*id)
            .ok_or_else(|| MemoryError::conflict(format!("node {} is no longer live", id)))?;
        if record.node.context() != survivor.context() {
            return Err(MemoryError::validation(format!(
                "cannot merge {} node {} into {} node {}",
                record.node.context(),
                id,
                survivor.context(),
                survivor.id
            )));
        }
        let mut other = record.node.clone();
        materialize_node(&mut other, decay, now);
        absorb(&mut survivor, &other);

        changes.nodes.push(NodeWrite {
            node: record.node.clone(),
            lifecycle: Lifecycle::Merged {
                into: cluster.survivor,
                at: now,
            },
            expected: Some(record.version),
        });
        changes
            .redirects
            .push(MergeRedirect::new(*id, cluster.survivor, now));
    }

    let lifecycle = match survivor_record.lifecycle {
        Lifecycle::Decayed { .. } if survivor.relevance.peak() >= decay.pruning_floor => {
            Lifecycle::Active
        }
        other => other,
    };
    changes.nodes.insert(
        0,
        NodeWrite {
            node: survivor,
            lifecycle,
            expected: Some(survivor_record.version),
        },
    );

    // Older redirects into a merged node now point at the survivor
    for redirect in snapshot.redirects().filter(|r| merged.contains(&r.to)) {
        changes.redirects.push(MergeRedirect::new(
            redirect.from,
            cluster.survivor,
            redirect.created_at,
        ));
    }

    let remap = |id: NodeId| if merged.contains(&id) { cluster.survivor } else { id };
    let mut incident = BTreeMap::new();
    for id in cluster.ids() {
        for record in snapshot.edges_of(id, Direction::Both) {
            incident.insert(record.edge.id, record);
        }
    }

    let mut groups: BTreeMap<EdgeKey, Vec<(MemoryEdge, Lifecycle, u64, bool)>> = BTreeMap::new();
    for record in incident.values() {
        let from = remap(record.edge.from_id);
        let to = remap(record.edge.to_id);
        if from == to {
            changes.edge_deletes.push((record.edge.id, record.version));
            continue;
        }
        let moved = from != record.edge.from_id || to != record.edge.to_id;
        let mut edge = record.edge.clone();
        edge.from_id = from;
        edge.to_id = to;
        groups
            .entry(edge.key())
            .or_default()
            .push((edge, record.lifecycle, record.version, moved));
    }

    for (_, mut group) in groups {
        group.sort_by(|a, b| {
            effective_strength(&b.0, decay, now)
                .partial_cmp(&effective_strength(&a.0, decay, now))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.reinforcement_count.cmp(&a.0.reinforcement_count))
                .then_with(|| a.0.created_at.cmp(&b.0.created_at))
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        let mut rest = group.into_iter();
        if let Some((edge, lifecycle, version, moved)) = rest.next() {
            if moved {
                changes.edges.push(EdgeWrite {
                    edge,
                    lifecycle,
                    expected: Some(version),
                });
            }
        }
        for (edge, _, version, _) in rest {
            changes.edge_deletes.push((edge.id, version));
        }
    }

    Ok(changes)
}

/// Fold `other` into `into`: union of sets and sequences, maximum of
/// scores, summed reinforcement, widest time span. The survivor keeps its
/// own content, embedding and key fields.
fn absorb(into: &mut MemoryNode, other: &MemoryNode) {
    into.emotional_weight = into.emotional_weight.max(other.emotional_weight);
    into.relevance.max_with(&other.relevance);
    into.reinforcement_count = into
        .reinforcement_count
        .saturating_add(other.reinforcement_count);
    into.last_accessed_at = into.last_accessed_at.max(other.last_accessed_at);
    into.created_at = into.created_at.min(other.created_at);
    into.relevance_as_of = into.relevance_as_of.max(other.relevance_as_of);
    union_into(&mut into.tags, &other.tags);

    match (&mut into.details, &other.details) {
        (NodeDetails::Experience(a), NodeDetails::Experience(b)) => {
            a.participants.extend(b.participants.iter().cloned());
            union_into(&mut a.lessons_learned, &b.lessons_learned);
            union_into(&mut a.insights, &b.insights);
            if a.location.is_none() {
                a.location = b.location.clone();
            }
        }
        (NodeDetails::Knowledge(a), NodeDetails::Knowledge(b)) => {
            union_into(&mut a.how_to_use, &b.how_to_use);
            a.understanding_level = a.understanding_level.max(b.understanding_level);
            a.related_concepts.extend(b.related_concepts.iter().cloned());
            if a.category.is_none() {
                a.category = b.category.clone();
            }
        }
        (NodeDetails::Relationship(a), NodeDetails::Relationship(b)) => {
            a.trust_level = a.trust_level.max(b.trust_level);
            a.personality_traits.extend(b.personality_traits.iter().cloned());
            a.interests.extend(b.interests.iter().cloned());
        }
        (NodeDetails::Current(a), NodeDetails::Current(b)) => {
            a.stress_level = a.stress_level.max(b.stress_level);
            union_into(&mut a.recent_experience_refs, &b.recent_experience_refs);
            union_into(&mut a.goals, &b.goals);
        }
        _ => {}
    }
}

fn union_into<T: Clone + PartialEq>(into: &mut Vec<T>, from: &[T]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

/// One consolidation pass over a store at a fixed instant
pub struct Consolidator<'a> {
    store: &'a GraphStore,
    config: &'a EngineConfig,
    now: DateTime<Utc>,
}

impl<'a> Consolidator<'a> {
    pub fn new(store: &'a GraphStore, config: &'a EngineConfig, now: DateTime<Utc>) -> Self {
        Self { store, config, now }
    }

    pub fn run(&self, scope: ConsolidationScope) -> Result<MergeReport> {
        let started = Instant::now();
        let mut report = MergeReport::default();

        let sweep = sweep_decay(self.store, self.config, self.now, scope)?;
        report.decayed = sweep.nodes_decayed;

        for context in scope.contexts() {
            self.merge_context(context, &mut report);
        }
        self.prune(scope, &mut report)?;
        self.evolve_schema(scope, &mut report)?;
        self.store.rebuild_index();

        log::info!(
            "[consolidation] {:?} done in {:?}: {}",
            scope,
            started.elapsed(),
            report
        );
        Ok(report)
    }

    fn merge_context(&self, context: MemoryContext, report: &mut MergeReport) {
        let snapshot = self.store.snapshot();
        for cluster in find_clusters(&snapshot, context, self.config, self.now) {
            match self.apply_cluster(&cluster) {
                Ok(()) => {
                    log::debug!(
                        "[consolidation] merged {:?} into {}",
                        cluster.merged,
                        cluster.survivor
                    );
                    report.merged += cluster.merged.len();
                }
                Err(e) => {
                    log::error!("[consolidation] {}", e);
                    for id in cluster.ids() {
                        log::error!("[consolidation] rolled back merge member {}", id);
                    }
                    report.failed_ids.extend(cluster.ids());
                }
            }
        }
    }

    /// Lock, re-plan against the locked state, commit. Any failure leaves
    /// the cluster exactly as it was.
    fn apply_cluster(&self, cluster: &MergeCluster) -> Result<()> {
        let ids = cluster.ids();
        let partial = |e: MemoryError| MemoryError::ConsolidationPartialFailure {
            reason: e.to_string(),
            ids: ids.clone(),
        };

        let snapshot = self.store.snapshot();
        let mut subgraph: BTreeSet<NodeId> = ids.iter().copied().collect();
        for id in &ids {
            for record in snapshot.edges_of(*id, Direction::Both) {
                subgraph.insert(record.edge.from_id);
                subgraph.insert(record.edge.to_id);
            }
        }
        let lock = self.store.lock_subgraph(subgraph).map_err(partial)?;

        let snapshot = self.store.snapshot();
        let changes = plan_merge(&snapshot, cluster, self.config, self.now).map_err(partial)?;
        self.store.commit(changes.under(&lock)).map_err(partial)?;
        Ok(())
    }

    fn prune(&self, scope: ConsolidationScope, report: &mut MergeReport) -> Result<()> {
        let window = self.config.decay.retention_window();
        let expired_nodes: Vec<NodeId> = self
            .store
            .snapshot()
            .live_nodes()
            .filter(|r| scope.includes(r.node.context()))
            .filter(|r| r.lifecycle.retention_elapsed(self.now, window))
            .map(|r| r.node.id)
            .collect();

        for id in expired_nodes {
            let snapshot = self.store.snapshot();
            let Some(record) = snapshot
                .live_node(id)
                .filter(|r| r.lifecycle.retention_elapsed(self.now, window))
            else {
                continue;
            };
            let edge_deletes: Vec<_> = snapshot
                .edges_of(id, Direction::Both)
                .into_iter()
                .map(|e| (e.edge.id, e.version))
                .collect();
            let deleted_edges = edge_deletes.len();
            let changes = ChangeSet {
                nodes: vec![NodeWrite {
                    node: record.node.clone(),
                    lifecycle: Lifecycle::Pruned { at: self.now },
                    expected: Some(record.version),
                }],
                edge_deletes,
                ..ChangeSet::default()
            };
            match self.store.commit(changes) {
                Ok(_) => {
                    report.pruned += 1;
                    report.edges_pruned += deleted_edges;
                }
                Err(MemoryError::ConflictRetry(reason)) => {
                    log::debug!("[consolidation] prune of {} deferred: {}", id, reason);
                }
                Err(e) => return Err(e),
            }
        }

        let snapshot = self.store.snapshot();
        let edge_deletes: Vec<_> = snapshot
            .edges()
            .filter(|r| scope.includes(r.edge.from_context))
            .filter(|r| r.lifecycle.retention_elapsed(self.now, window))
            .map(|r| (r.edge.id, r.version))
            .collect();
        let redirect_deletes: Vec<NodeId> = snapshot
            .redirects()
            .filter(|r| r.is_expired(self.now, self.config.consolidation.redirect_grace()))
            .filter(|r| {
                snapshot
                    .node(r.from)
                    .map(|n| scope.includes(n.node.context()))
                    .unwrap_or(true)
            })
            .map(|r| r.from)
            .collect();

        let (edge_count, redirect_count) = (edge_deletes.len(), redirect_deletes.len());
        let changes = ChangeSet {
            edge_deletes,
            redirect_deletes,
            ..ChangeSet::default()
        };
        match self.store.commit(changes) {
            Ok(_) => {
                report.edges_pruned += edge_count;
                report.redirects_expired += redirect_count;
            }
            Err(MemoryError::ConflictRetry(reason)) => {
                log::debug!("[consolidation] edge pruning deferred: {}", reason);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn evolve_schema(&self, scope: ConsolidationScope, report: &mut MergeReport) -> Result<()> {
        let min = self.config.consolidation.schema_evolution_min_occurrences;
        let due: Vec<_> = self
            .store
            .snapshot()
            .pending_labels()
            .filter(|(key, count)| *count >= min && scope.includes(key.from_context))
            .map(|(key, count)| (key.clone(), count))
            .collect();

        for (key, count) in due {
            let snapshot = self.store.snapshot();
            let types = snapshot.types();
            if types.resolve(&key.label, key.from_context, key.to_context).is_some() {
                self.store.commit(ChangeSet {
                    labels: vec![(key, 0)],
                    ..ChangeSet::default()
                })?;
                continue;
            }

            let name = types.name_for(&key.label, key.from_context, key.to_context);
            let canonical = RelationshipType::canonical(key.from_context, key.to_context);
            let retyped: Vec<EdgeWrite> = snapshot
                .edges()
                .filter(|r| {
                    r.edge.from_context == key.from_context
                        && r.edge.to_context == key.to_context
                        && r.edge.relationship_type == canonical
                        && r.edge
                            .label
                            .as_deref()
                            .is_some_and(|l| normalize_label(l) == key.label)
                })
                .map(|r| EdgeWrite {
                    edge: r
                        .edge
                        .clone()
                        .with_type(RelationshipType::Registered(name.clone())),
                    lifecycle: r.lifecycle,
                    expected: Some(r.version),
                })
                .collect();
            let retyped_count = retyped.len();

            let changes = ChangeSet {
                types: vec![RegisteredType {
                    name: name.clone(),
                    label: key.label.clone(),
                    from_context: key.from_context,
                    to_context: key.to_context,
                    registered_at: self.now,
                    occurrences: count,
                }],
                edges: retyped,
                labels: vec![(key.clone(), 0)],
                ..ChangeSet::default()
            };
            match self.store.commit(changes) {
                Ok(_) => {
                    log::info!(
                        "[consolidation] registered relationship type {} ({} -> {}, {} edges retyped)",
                        name,
                        key.from_context,
                        key.to_context,
                        retyped_count
                    );
                    report.new_types.push(name);
                }
                Err(MemoryError::ConflictRetry(reason)) => {
                    log::debug!("[consolidation] registration of {} deferred: {}", name, reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Runs consolidation on a fixed interval until shut down
pub struct ConsolidationScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConsolidationScheduler {
    /// Spawn on the current tokio runtime. The first run happens one
    /// `every` after spawning.
    pub fn spawn(engine: Arc<MemoryEngine>, every: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            log::info!("[consolidation] scheduler started, every {:?}", every);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.run_consolidation(ConsolidationScope::All).await {
                            Ok(report) => log::info!("[consolidation] scheduled run: {}", report),
                            Err(e) => log::error!("[consolidation] scheduled run failed: {}", e),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("[consolidation] scheduler stopped");
        });
        Self { shutdown, handle }
    }

    /// Stop after any in-flight run finishes
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            log::error!("[consolidation] scheduler task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::ListFilter;
    use chrono::Duration as ChronoDuration;

    fn config() -> EngineConfig {
        EngineConfig::default().with_dimension(3)
    }

    fn knowledge(concept: &str, embedding: Vec<f32>, at: DateTime<Utc>) -> MemoryNode {
        MemoryNode::builder()
            .knowledge(concept, format!("{} explained", concept))
            .how_to_use(format!("use {}", concept))
            .content(format!("notes on {}", concept))
            .embedding(embedding)
            .created_at(at)
            .build()
            .unwrap()
    }

    fn experience(event: &str, embedding: Vec<f32>, at: DateTime<Utc>) -> MemoryNode {
        MemoryNode::builder()
            .experience(event)
            .content(format!("{} happened", event))
            .embedding(embedding)
            .created_at(at)
            .build()
            .unwrap()
    }

    fn link(store: &GraphStore, from: &MemoryNode, to: &MemoryNode, strength: f32, at: DateTime<Utc>) {
        store
            .put_edge(MemoryEdge::new(
                (from.id, from.context()),
                (to.id, to.context()),
                strength,
                at,
            ))
            .unwrap();
    }

    #[test]
    fn test_find_clusters_picks_most_relevant_survivor() {
        let store = GraphStore::in_memory();
        let now = Utc::now();
        let low = knowledge("python", vec![1.0, 0.0, 0.0], now);
        let mut high = knowledge("python basics", vec![0.99, 0.05, 0.0], now);
        high.relevance.set(MemoryContext::Experience, 0.9);
        let other = knowledge("cooking", vec![0.0, 1.0, 0.0], now);
        store.put(low.clone()).unwrap();
        store.put(high.clone()).unwrap();
        store.put(other).unwrap();

        let clusters = find_clusters(&store.snapshot(), MemoryContext::Knowledge, &config(), now);
        assert_eq!(
            clusters,
            vec![MergeCluster {
                survivor: high.id,
                merged: vec![low.id],
            }]
        );
    }

    #[test]
    fn test_find_clusters_requires_similarity_above_threshold() {
        let store = GraphStore::in_memory();
        let now = Utc::now();
        let a = knowledge("tokio", vec![1.0, 0.0, 0.0], now);
        let b = knowledge("tokio runtime", vec![0.9, 0.3, 0.0], now);
        store.put(a.clone()).unwrap();
        store.put(b.clone()).unwrap();

        let mut cfg = config();
        cfg.consolidation.merge_threshold = cosine_similarity(&a.embedding, &b.embedding);
        let snapshot = store.snapshot();
        assert!(find_clusters(&snapshot, MemoryContext::Knowledge, &cfg, now).is_empty());

        cfg.consolidation.merge_threshold -= 1e-4;
        assert_eq!(
            find_clusters(&snapshot, MemoryContext::Knowledge, &cfg, now).len(),
            1
        );
    }

    #[test]
    fn test_merge_folds_fields_and_redirects_edges() {
        let store = GraphStore::in_memory();
        let now = Utc::now();
        let mut survivor = knowledge("python", vec![1.0, 0.0, 0.0], now);
        survivor.relevance.set(MemoryContext::Experience, 0.9);
        let mut duplicate = knowledge("python", vec![0.99, 0.01, 0.0], now - ChronoDuration::days(2));
        duplicate.relevance.set(MemoryContext::Current, 0.95);
        duplicate.reinforcement_count = 2;
        if let NodeDetails::Knowledge(d) = &mut duplicate.details {
            d.how_to_use.push("debug scripts".into());
            d.understanding_level = 0.8;
        }
        duplicate.relevance_as_of = now;
        duplicate.last_accessed_at = now;
        let exp = experience("debugging session", vec![0.5, 0.5, 0.0], now);

        for n in [&survivor, &duplicate, &exp] {
            store.put((*n).clone()).unwrap();
        }
        // Both knowledge nodes link to the experience; after the merge only
        // the stronger edge of each type may remain
        link(&store, &exp, &survivor, 0.6, now);
        link(&store, &exp, &duplicate, 0.8, now);
        link(&store, &survivor, &exp, 0.6, now);
        link(&store, &duplicate, &exp, 0.7, now);
        // Edge between the two duplicates becomes a self-loop
        link(&store, &duplicate, &survivor, 0.9, now);

        let cfg = config();
        let report = Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::Context(MemoryContext::Knowledge))
            .unwrap();
        assert_eq!(report.merged, 1);
        assert!(report.failed_ids.is_empty());

        let merged = store.get(survivor.id).unwrap();
        assert_eq!(merged.created_at, duplicate.created_at);
        assert_eq!(merged.reinforcement_count, 2);
        assert!((merged.relevance.get(MemoryContext::Experience) - 0.9).abs() < 1e-6);
        assert!((merged.relevance.get(MemoryContext::Current) - 0.95).abs() < 1e-6);
        if let NodeDetails::Knowledge(d) = &merged.details {
            assert!(d.how_to_use.contains(&"debug scripts".to_string()));
            assert_eq!(d.understanding_level, 0.8);
        } else {
            panic!("survivor changed variant");
        }

        assert!(matches!(
            store.get(duplicate.id),
            Err(MemoryError::StaleReference { redirect: Some(to), .. }) if to == survivor.id
        ));
        assert_eq!(store.resolve(duplicate.id).unwrap(), survivor.id);

        let edges = store.get_edges_between(survivor.id, Direction::Both).unwrap();
        assert_eq!(edges.len(), 2);
        let incoming = edges.iter().find(|e| e.to_id == survivor.id).unwrap();
        assert!((incoming.strength - 0.8).abs() < 1e-6);
        let outgoing = edges.iter().find(|e| e.from_id == survivor.id).unwrap();
        assert!((outgoing.strength - 0.7).abs() < 1e-6);
        assert!(store
            .get_edges_between(duplicate.id, Direction::Both)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_consolidation_is_idempotent() {
        let store = GraphStore::in_memory();
        let now = Utc::now();
        for i in 0..3 {
            store
                .put(knowledge("python", vec![1.0, 0.001 * i as f32, 0.0], now))
                .unwrap();
        }
        store.put(knowledge("rust", vec![0.0, 1.0, 0.0], now)).unwrap();

        let cfg = config();
        let first = Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::All)
            .unwrap();
        assert_eq!(first.merged, 2);
        let generation = store.snapshot().generation();

        let second = Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::All)
            .unwrap();
        assert!(second.is_noop(), "second run changed the graph: {}", second);
        assert_eq!(store.snapshot().generation(), generation);
    }

    #[test]
    fn test_decay_then_prune_after_retention() {
        let store = GraphStore::in_memory();
        let clock = ManualClock::new(Utc::now());
        let start = crate::clock::Clock::now(&clock);
        let mut cfg = config();
        cfg.decay = crate::config::DecayConfig::uniform(0.1);

        let mut node = experience("old meeting", vec![1.0, 0.0, 0.0], start);
        for c in node.context().others() {
            node.relevance.set(c, 0.9);
        }
        let other = knowledge("agenda", vec![0.0, 1.0, 0.0], start);
        store.put(node.clone()).unwrap();
        store.put(other.clone()).unwrap();
        link(&store, &node, &other, 0.9, start);

        clock.advance(ChronoDuration::days(30));
        let now = crate::clock::Clock::now(&clock);
        let report = Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::All)
            .unwrap();
        assert!(report.decayed >= 1);
        assert_eq!(report.pruned, 0);
        assert!(store.get_record(node.id).unwrap().lifecycle.is_decayed());
        // Decayed nodes stay listable until pruned
        assert_eq!(
            store
                .list_by_context(MemoryContext::Experience, ListFilter::default())
                .iter()
                .count(),
            1
        );

        clock.advance(ChronoDuration::days(7));
        let now = crate::clock::Clock::now(&clock);
        let report = Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::All)
            .unwrap();
        assert!(report.pruned >= 1);
        assert!(matches!(store.get(node.id), Err(MemoryError::NotFound(_))));
        assert!(matches!(
            store.get_record(node.id).unwrap().lifecycle,
            Lifecycle::Pruned { .. }
        ));
        assert!(store
            .list_by_context(MemoryContext::Experience, ListFilter::default())
            .iter()
            .next()
            .is_none());
        // The id stays reserved
        assert!(store.put(node).unwrap_err().is_validation());
    }

    #[test]
    fn test_failed_cluster_is_rolled_back_and_reported() {
        let store = GraphStore::in_memory();
        let now = Utc::now();
        let a = knowledge("python", vec![1.0, 0.0, 0.0], now);
        let b = knowledge("python", vec![1.0, 0.0, 0.0], now);
        store.put(a.clone()).unwrap();
        store.put(b.clone()).unwrap();
        let before = store.snapshot();

        // Another writer holds one member
        let held = store.lock_subgraph([b.id]).unwrap();
        let cfg = config();
        let report = Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::Context(MemoryContext::Knowledge))
            .unwrap();
        assert_eq!(report.merged, 0);
        assert_eq!(report.failed_ids.len(), 2);
        assert!(report.failed_ids.contains(&a.id) && report.failed_ids.contains(&b.id));
        assert_eq!(store.get(a.id).unwrap(), before.node(a.id).unwrap().node);
        assert_eq!(store.get(b.id).unwrap(), before.node(b.id).unwrap().node);

        drop(held);
        let report = Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::Context(MemoryContext::Knowledge))
            .unwrap();
        assert_eq!(report.merged, 1);
    }

    #[test]
    fn test_failed_write_rolls_back_merge() {
        let store = GraphStore::in_memory();
        let now = Utc::now();
        let a = knowledge("python", vec![1.0, 0.0, 0.0], now);
        let b = knowledge("python", vec![1.0, 0.0, 0.0], now);
        store.put(a.clone()).unwrap();
        store.put(b.clone()).unwrap();

        let cfg = config();
        let snapshot = store.snapshot();
        let cluster = find_clusters(&snapshot, MemoryContext::Knowledge, &cfg, now)
            .pop()
            .unwrap();
        store.fail_next_writes(1);
        let err = Consolidator::new(&store, &cfg, now)
            .apply_cluster(&cluster)
            .unwrap_err();
        assert!(matches!(err, MemoryError::ConsolidationPartialFailure { ref ids, .. } if ids.len() == 2));
        assert!(store.get(a.id).is_ok());
        assert!(store.get(b.id).is_ok());
        assert!(!store.is_locked(a.id));
    }

    #[test]
    fn test_schema_evolution_registers_recurring_label() {
        let store = GraphStore::in_memory();
        let now = Utc::now();
        let mut cfg = config();
        cfg.consolidation.schema_evolution_min_occurrences = 2;

        let key = crate::relationship::LabelKey {
            label: "INSPIRED".into(),
            from_context: MemoryContext::Experience,
            to_context: MemoryContext::Knowledge,
        };
        // Pairwise dissimilar so the merge step leaves them alone
        let embeddings = [
            (vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]),
            (vec![0.0, 0.0, 1.0], vec![0.7, 0.0, -0.7]),
        ];
        let mut edge_ids = Vec::new();
        for (i, (exp_embedding, idea_embedding)) in embeddings.into_iter().enumerate() {
            let e = experience(&format!("talk {}", i), exp_embedding, now);
            let k = knowledge(&format!("idea {}", i), idea_embedding, now);
            store.put(e.clone()).unwrap();
            store.put(k.clone()).unwrap();
            let edge = MemoryEdge::new((e.id, e.context()), (k.id, k.context()), 0.7, now)
                .with_label("inspired");
            edge_ids.push(edge.id);
            store
                .commit(ChangeSet {
                    edges: vec![EdgeWrite {
                        edge,
                        lifecycle: Lifecycle::Active,
                        expected: None,
                    }],
                    labels: vec![(key.clone(), i as u32 + 1)],
                    ..ChangeSet::default()
                })
                .unwrap();
        }

        let report = Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::All)
            .unwrap();
        assert_eq!(report.new_types, vec!["INSPIRED".to_string()]);
        for id in edge_ids {
            assert_eq!(
                store.get_edge(id).unwrap().edge.relationship_type,
                RelationshipType::Registered("INSPIRED".into())
            );
        }
        let snapshot = store.snapshot();
        assert_eq!(snapshot.label_count(&key), 0);
        assert_eq!(
            snapshot
                .types()
                .resolve("inspired", MemoryContext::Experience, MemoryContext::Knowledge),
            Some(RelationshipType::Registered("INSPIRED".into()))
        );
    }

    #[test]
    fn test_expired_redirects_are_dropped() {
        let store = GraphStore::in_memory();
        let now = Utc::now();
        let a = knowledge("python", vec![1.0, 0.0, 0.0], now);
        let b = knowledge("python", vec![1.0, 0.0, 0.0], now);
        store.put(a.clone()).unwrap();
        store.put(b.clone()).unwrap();
        let cfg = config();
        Consolidator::new(&store, &cfg, now)
            .run(ConsolidationScope::All)
            .unwrap();
        assert_eq!(store.snapshot().redirects().count(), 1);
        let merged_id = if store.get(a.id).is_ok() { b.id } else { a.id };

        let later = now + cfg.consolidation.redirect_grace() + ChronoDuration::days(1);
        let report = Consolidator::new(&store, &cfg, later)
            .run(ConsolidationScope::All)
            .unwrap();
        assert_eq!(report.redirects_expired, 1);
        assert!(matches!(
            store.get(merged_id),
            Err(MemoryError::StaleReference { redirect: None, .. })
        ));
        assert!(store.resolve(merged_id).is_err());
    }
}
