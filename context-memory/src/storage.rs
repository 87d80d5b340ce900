//! RocksDB storage for the memory graph
//!
//! Nodes, edges, merge redirects, registered relationship types and pending
//! link labels persist in RocksDB with LZ4 compression. The whole graph is
//! mirrored in memory as an immutable [`GraphSnapshot`]. Every mutation
//! builds the next snapshot from a [`ChangeSet`], commits one `WriteBatch`,
//! and only then swaps the snapshot in, so a failed write leaves disk and
//! memory at the previous version.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};

use crate::context::MemoryContext;
use crate::error::{MemoryError, Result};
use crate::index::{cosine_similarity, VectorIndex};
use crate::node::{MemoryNode, NodeId};
use crate::relationship::{
    EdgeId, EdgeKey, LabelKey, MemoryEdge, RegisteredType, TypeRegistry,
};
use crate::shard::{ShardedMap, ShardedSet};
use crate::temporal::{Lifecycle, MergeRedirect};

const NODE_PREFIX: &str = "node:";
const EDGE_PREFIX: &str = "edge:";
const REDIRECT_PREFIX: &str = "redirect:";
const TYPE_PREFIX: &str = "type:";
const LABEL_PREFIX: &str = "label:";

/// A stored node with its lifecycle state and write version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node: MemoryNode,
    pub lifecycle: Lifecycle,
    /// Monotonic per-node write counter; 1 after the first write
    pub version: u64,
}

/// A stored edge with its lifecycle state and write version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub edge: MemoryEdge,
    pub lifecycle: Lifecycle,
    pub version: u64,
}

/// Which incident edges to return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// Lifecycle states a listing includes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    /// Active and Decayed
    #[default]
    Live,
    ActiveOnly,
    DecayedOnly,
}

/// Filter for [`GraphStore::list_by_context`]
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub states: StateFilter,
    pub tag: Option<String>,
    /// Only nodes accessed at or after this instant
    pub accessed_since: Option<DateTime<Utc>>,
}

impl ListFilter {
    pub fn active_only() -> Self {
        Self {
            states: StateFilter::ActiveOnly,
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn accessed_since(mut self, at: DateTime<Utc>) -> Self {
        self.accessed_since = Some(at);
        self
    }

    fn matches(&self, record: &NodeRecord) -> bool {
        let state_ok = match self.states {
            StateFilter::Live => record.lifecycle.is_live(),
            StateFilter::ActiveOnly => record.lifecycle.is_active(),
            StateFilter::DecayedOnly => record.lifecycle.is_decayed(),
        };
        state_ok
            && self
                .tag
                .as_ref()
                .map(|t| record.node.tags.iter().any(|own| own == t))
                .unwrap_or(true)
            && self
                .accessed_since
                .map(|at| record.node.last_accessed_at >= at)
                .unwrap_or(true)
    }
}

type RecencyKey = (Reverse<DateTime<Utc>>, NodeId);

/// Point-in-time view of the whole graph.
///
/// Snapshots are never mutated after publication; holders see a consistent
/// graph for as long as they keep the `Arc`.
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    generation: u64,
    nodes: ShardedMap<NodeId, Arc<NodeRecord>>,
    edges: ShardedMap<EdgeId, Arc<EdgeRecord>>,
    edge_keys: ShardedMap<EdgeKey, EdgeId>,
    outgoing: ShardedMap<NodeId, BTreeSet<EdgeId>>,
    incoming: ShardedMap<NodeId, BTreeSet<EdgeId>>,
    /// (context, lastAccessedAt desc) over live nodes
    by_recency: HashMap<MemoryContext, ShardedSet<RecencyKey>>,
    /// (context, lowercased key) over live nodes
    by_key: ShardedMap<(MemoryContext, String), BTreeSet<NodeId>>,
    /// (generation, id) at which each live node's embedding was written
    embedded: HashMap<MemoryContext, ShardedSet<(u64, NodeId)>>,
    embedded_at: ShardedMap<NodeId, u64>,
    redirects: ShardedMap<NodeId, MergeRedirect>,
    types: TypeRegistry,
    pending_labels: BTreeMap<LabelKey, u32>,
}

/// How [`GraphSnapshot::nearest`] gathers candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPlan {
    /// HNSW hits plus an exact pass over the nodes embedded after the
    /// index was built
    Indexed { unindexed: usize },
    /// Exact scan of the whole context
    Scan,
}

impl GraphSnapshot {
    /// Incremented by every committed change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&id).map(|r| r.as_ref())
    }

    /// Node if it is Active or Decayed
    pub fn live_node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.node(id).filter(|r| r.lifecycle.is_live())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values().map(|r| r.as_ref())
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes().filter(|r| r.lifecycle.is_live())
    }

    /// Live nodes of `context`, most recently accessed first
    pub fn live_nodes_in(&self, context: MemoryContext) -> impl Iterator<Item = &NodeRecord> {
        self.by_recency
            .get(&context)
            .into_iter()
            .flat_map(ShardedSet::iter)
            .filter_map(|(_, id)| self.node(*id))
    }

    pub fn edge(&self, id: EdgeId) -> Option<&EdgeRecord> {
        self.edges.get(&id).map(|r| r.as_ref())
    }

    pub fn edge_by_key(&self, key: &EdgeKey) -> Option<&EdgeRecord> {
        self.edge_keys.get(key).and_then(|id| self.edge(*id))
    }

    pub fn edges(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.edges.values().map(|r| r.as_ref())
    }

    /// Edges incident to `node` in the given direction
    pub fn edges_of(&self, node: NodeId, direction: Direction) -> Vec<&EdgeRecord> {
        let mut ids: BTreeSet<EdgeId> = BTreeSet::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            ids.extend(self.outgoing.get(&node).into_iter().flatten());
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            ids.extend(self.incoming.get(&node).into_iter().flatten());
        }
        ids.into_iter().filter_map(|id| self.edge(id)).collect()
    }

    /// Live nodes of `context` whose key matches `key` (case-insensitive)
    pub fn find_by_key(&self, context: MemoryContext, key: &str) -> Vec<&NodeRecord> {
        self.by_key
            .get(&(context, normalize_key(key)))
            .into_iter()
            .flatten()
            .filter_map(|id| self.node(*id))
            .collect()
    }

    /// Distinct lowercased keys of live nodes, per context
    pub fn keys(&self) -> impl Iterator<Item = (MemoryContext, &str)> {
        self.by_key
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|((context, key), _)| (*context, key.as_str()))
    }

    pub fn redirect(&self, id: NodeId) -> Option<&MergeRedirect> {
        self.redirects.get(&id)
    }

    pub fn redirects(&self) -> impl Iterator<Item = &MergeRedirect> {
        self.redirects.values()
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn pending_labels(&self) -> impl Iterator<Item = (&LabelKey, u32)> {
        self.pending_labels.iter().map(|(k, v)| (k, *v))
    }

    pub fn label_count(&self, key: &LabelKey) -> u32 {
        self.pending_labels.get(key).copied().unwrap_or(0)
    }

    /// Follow merge redirects from `id` to a live node
    pub fn resolve(&self, id: NodeId) -> Result<NodeId> {
        let mut current = id;
        // Redirect chains are short; the bound only guards against a corrupt cycle
        for _ in 0..=self.redirects.len() {
            let record = self.node(current).ok_or_else(|| MemoryError::not_found(current))?;
            match record.lifecycle {
                Lifecycle::Active | Lifecycle::Decayed { .. } => return Ok(current),
                Lifecycle::Pruned { .. } => return Err(MemoryError::not_found(current)),
                Lifecycle::Merged { .. } => match self.redirects.get(&current) {
                    Some(redirect) => current = redirect.to,
                    None => return Err(MemoryError::stale(id, None)),
                },
            }
        }
        Err(MemoryError::stale(id, None))
    }

    /// Live nodes of `context` whose embedding was written after
    /// `generation`
    pub fn embedded_since(
        &self,
        context: MemoryContext,
        generation: u64,
    ) -> impl Iterator<Item = NodeId> + '_ {
        let lower = (generation.saturating_add(1), NodeId::from_uuid(uuid::Uuid::nil()));
        self.embedded
            .get(&context)
            .into_iter()
            .flat_map(move |set| set.iter_from(&lower))
            .map(|(_, id)| *id)
    }

    /// Live nodes an index built from `index`'s generation does not hold;
    /// every live node when there is no usable index
    pub fn unindexed(&self, index: Option<&VectorIndex>) -> usize {
        match index {
            Some(index) if index.generation() <= self.generation => MemoryContext::ALL
                .into_iter()
                .map(|context| self.embedded_since(context, index.generation()).count())
                .sum(),
            _ => self.embedded.values().map(ShardedSet::len).sum(),
        }
    }

    /// An index built from this generation or an earlier one can serve
    /// this snapshot together with the nodes embedded since
    pub fn search_plan(&self, context: MemoryContext, index: Option<&VectorIndex>) -> SearchPlan {
        match index {
            Some(index) if index.generation() <= self.generation => SearchPlan::Indexed {
                unindexed: self.embedded_since(context, index.generation()).count(),
            },
            _ => SearchPlan::Scan,
        }
    }

    /// Most similar live nodes of `context` to `query`, best first.
    ///
    /// See [`SearchPlan`] for how `index` is used. Ties go to the more
    /// recently created node.
    pub fn nearest(
        &self,
        context: MemoryContext,
        query: &[f32],
        limit: usize,
        index: Option<&VectorIndex>,
        include_decayed: bool,
    ) -> Vec<(NodeId, f32)> {
        if limit == 0 {
            return Vec::new();
        }
        let keep = |r: &&NodeRecord| {
            if include_decayed {
                r.lifecycle.is_live()
            } else {
                r.lifecycle.is_active()
            }
        };

        let candidates: Vec<&NodeRecord> = match index {
            Some(index) if index.generation() <= self.generation => {
                let mut ids = index.search(context, query, limit.saturating_mul(2));
                ids.extend(self.embedded_since(context, index.generation()));
                ids.sort_unstable();
                ids.dedup();
                // Merged and pruned hits drop out here
                ids.into_iter()
                    .filter_map(|id| self.node(id))
                    .filter(keep)
                    .collect()
            }
            _ => self.live_nodes_in(context).filter(keep).collect(),
        };
        let mut scored: Vec<(&NodeRecord, f32)> = candidates
            .into_iter()
            .map(|r| (r, cosine_similarity(query, &r.node.embedding)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.node.created_at.cmp(&a.0.node.created_at))
                .then_with(|| a.0.node.id.cmp(&b.0.node.id))
        });
        scored.truncate(limit);
        scored.into_iter().map(|(r, s)| (r.node.id, s)).collect()
    }

    /// Insert or replace a node written at `generation`
    fn upsert_node(&mut self, record: NodeRecord, generation: u64) {
        let id = record.node.id;
        let context = record.node.context();
        let old = self.nodes.get(&id).cloned();
        if let Some(old) = &old {
            self.unindex_node(old);
        }

        let re_embedded = old
            .as_ref()
            .map(|o| o.node.embedding != record.node.embedding)
            .unwrap_or(true);
        if !record.lifecycle.is_live() || re_embedded {
            if let (Some(previous), Some(old)) = (self.embedded_at.remove(&id), &old) {
                if let Some(set) = self.embedded.get_mut(&old.node.context()) {
                    set.remove(&(previous, id));
                }
            }
        }
        if record.lifecycle.is_live() && re_embedded {
            self.embedded_at.insert(id, generation);
            self.embedded
                .entry(context)
                .or_default()
                .insert((generation, id));
        }

        let record = Arc::new(record);
        if record.lifecycle.is_live() {
            self.by_recency
                .entry(context)
                .or_default()
                .insert((Reverse(record.node.last_accessed_at), id));
            self.by_key
                .get_or_default((context, normalize_key(record.node.details.key())))
                .insert(id);
        }
        self.nodes.insert(id, record);
    }

    fn unindex_node(&mut self, record: &NodeRecord) {
        let id = record.node.id;
        let context = record.node.context();
        if let Some(set) = self.by_recency.get_mut(&context) {
            set.remove(&(Reverse(record.node.last_accessed_at), id));
        }
        let key = (context, normalize_key(record.node.details.key()));
        if let Some(set) = self.by_key.get_mut(&key) {
            set.remove(&id);
            if set.is_empty() {
                self.by_key.remove(&key);
            }
        }
    }

    fn upsert_edge(&mut self, record: EdgeRecord) {
        let id = record.edge.id;
        self.remove_edge(id);
        self.edge_keys.insert(record.edge.key(), id);
        self.outgoing.get_or_default(record.edge.from_id).insert(id);
        self.incoming.get_or_default(record.edge.to_id).insert(id);
        self.edges.insert(id, Arc::new(record));
    }

    fn remove_edge(&mut self, id: EdgeId) -> Option<Arc<EdgeRecord>> {
        let old = self.edges.remove(&id)?;
        let key = old.edge.key();
        if self.edge_keys.get(&key) == Some(&id) {
            self.edge_keys.remove(&key);
        }
        if let Some(set) = self.outgoing.get_mut(&old.edge.from_id) {
            set.remove(&id);
        }
        if let Some(set) = self.incoming.get_mut(&old.edge.to_id) {
            set.remove(&id);
        }
        Some(old)
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Lazy, restartable listing of one context's live nodes, most recently
/// accessed first. Holds the snapshot it was taken from.
pub struct NodeListing {
    snapshot: Arc<GraphSnapshot>,
    context: MemoryContext,
    filter: ListFilter,
}

impl NodeListing {
    /// Iterate from the start; may be called any number of times
    pub fn iter(&self) -> impl Iterator<Item = &MemoryNode> + '_ {
        self.snapshot
            .by_recency
            .get(&self.context)
            .into_iter()
            .flat_map(ShardedSet::iter)
            .filter_map(|(_, id)| self.snapshot.node(*id))
            .filter(|r| self.filter.matches(r))
            .map(|r| &r.node)
    }

    pub fn snapshot(&self) -> &Arc<GraphSnapshot> {
        &self.snapshot
    }
}

impl<'a> IntoIterator for &'a NodeListing {
    type Item = &'a MemoryNode;
    type IntoIter = Box<dyn Iterator<Item = &'a MemoryNode> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// A node write inside a [`ChangeSet`]. `expected: None` inserts.
#[derive(Debug, Clone)]
pub(crate) struct NodeWrite {
    pub node: MemoryNode,
    pub lifecycle: Lifecycle,
    pub expected: Option<u64>,
}

/// An edge write inside a [`ChangeSet`]. `expected: None` inserts.
#[derive(Debug, Clone)]
pub(crate) struct EdgeWrite {
    pub edge: MemoryEdge,
    pub lifecycle: Lifecycle,
    pub expected: Option<u64>,
}

/// Writes committed together, all or nothing.
///
/// Applied in order: types, nodes, edge deletions, edge writes, redirects,
/// labels. Each write is checked against the state produced by the ones
/// before it.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChangeSet {
    pub types: Vec<RegisteredType>,
    pub nodes: Vec<NodeWrite>,
    pub edge_deletes: Vec<(EdgeId, u64)>,
    pub edges: Vec<EdgeWrite>,
    pub redirects: Vec<MergeRedirect>,
    pub redirect_deletes: Vec<NodeId>,
    /// Absolute counts; zero removes the label
    pub labels: Vec<(LabelKey, u32)>,
    /// Subgraph locks held by the writer
    pub owned_locks: BTreeSet<NodeId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
            && self.nodes.is_empty()
            && self.edge_deletes.is_empty()
            && self.edges.is_empty()
            && self.redirects.is_empty()
            && self.redirect_deletes.is_empty()
            && self.labels.is_empty()
    }

    pub fn under(mut self, lock: &SubgraphLock) -> Self {
        self.owned_locks.extend(lock.ids.iter().copied());
        self
    }

    fn touched_nodes(&self, snapshot: &GraphSnapshot) -> BTreeSet<NodeId> {
        let mut ids: BTreeSet<NodeId> = self.nodes.iter().map(|w| w.node.id).collect();
        for w in &self.edges {
            ids.insert(w.edge.from_id);
            ids.insert(w.edge.to_id);
        }
        for (id, _) in &self.edge_deletes {
            if let Some(record) = snapshot.edge(*id) {
                ids.insert(record.edge.from_id);
                ids.insert(record.edge.to_id);
            }
        }
        ids
    }
}

/// Exclusive lock on a set of nodes, released on drop
pub struct SubgraphLock {
    locks: Arc<DashMap<NodeId, ()>>,
    ids: BTreeSet<NodeId>,
}

impl SubgraphLock {
    pub fn ids(&self) -> &BTreeSet<NodeId> {
        &self.ids
    }
}

impl Drop for SubgraphLock {
    fn drop(&mut self) {
        for id in &self.ids {
            self.locks.remove(id);
        }
    }
}

/// Versioned graph store over RocksDB, or memory only
pub struct GraphStore {
    db: Option<Arc<DB>>,
    state: RwLock<Arc<GraphSnapshot>>,
    write_lock: Mutex<()>,
    locks: Arc<DashMap<NodeId, ()>>,
    index: RwLock<Option<Arc<VectorIndex>>>,
    index_building: AtomicBool,
    #[cfg(test)]
    failing_writes: std::sync::atomic::AtomicU32,
}

impl GraphStore {
    /// Open (or create) a persistent store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        crate::migration::check_version(&db)?;

        let snapshot = load_snapshot(&db)?;
        log::info!(
            "[store] opened at {}: {} nodes, {} edges, {} redirects",
            path.display(),
            snapshot.nodes.len(),
            snapshot.edges.len(),
            snapshot.redirects.len()
        );

        Ok(Self::with_state(Some(Arc::new(db)), snapshot))
    }

    /// Non-persistent store with the same semantics
    pub fn in_memory() -> Self {
        Self::with_state(None, GraphSnapshot::default())
    }

    fn with_state(db: Option<Arc<DB>>, snapshot: GraphSnapshot) -> Self {
        Self {
            db,
            state: RwLock::new(Arc::new(snapshot)),
            write_lock: Mutex::new(()),
            locks: Arc::new(DashMap::new()),
            index: RwLock::new(None),
            index_building: AtomicBool::new(false),
            #[cfg(test)]
            failing_writes: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.db.is_some()
    }

    /// Current consistent view
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.state.read().clone()
    }

    /// Insert a new node. Fails if the id was ever assigned, including
    /// tombstoned ids.
    pub fn put(&self, node: MemoryNode) -> Result<NodeId> {
        let id = node.id;
        self.commit(ChangeSet {
            nodes: vec![NodeWrite {
                node,
                lifecycle: Lifecycle::Active,
                expected: None,
            }],
            ..ChangeSet::default()
        })?;
        Ok(id)
    }

    /// Replace a live node's fields, checking the version read by the caller.
    /// Only Active and Decayed states can be written here.
    pub fn update_node(
        &self,
        node: MemoryNode,
        lifecycle: Lifecycle,
        expected_version: u64,
    ) -> Result<u64> {
        if !lifecycle.is_live() {
            return Err(MemoryError::validation(format!(
                "cannot move node {} to {} directly",
                node.id,
                lifecycle.label()
            )));
        }
        let id = node.id;
        let snapshot = self.commit(ChangeSet {
            nodes: vec![NodeWrite {
                node,
                lifecycle,
                expected: Some(expected_version),
            }],
            ..ChangeSet::default()
        })?;
        Ok(snapshot.node(id).map(|r| r.version).unwrap_or(expected_version + 1))
    }

    /// Get a live node
    pub fn get(&self, id: NodeId) -> Result<MemoryNode> {
        let snapshot = self.snapshot();
        let record = snapshot.node(id).ok_or_else(|| MemoryError::not_found(id))?;
        match record.lifecycle {
            Lifecycle::Active | Lifecycle::Decayed { .. } => Ok(record.node.clone()),
            Lifecycle::Pruned { .. } => Err(MemoryError::not_found(id)),
            // The survivor is only named while the redirect is kept
            Lifecycle::Merged { .. } => Err(MemoryError::stale(
                id,
                snapshot.redirect(id).map(|r| r.to),
            )),
        }
    }

    /// Get the stored record in any lifecycle state
    pub fn get_record(&self, id: NodeId) -> Result<NodeRecord> {
        self.snapshot()
            .node(id)
            .cloned()
            .ok_or_else(|| MemoryError::not_found(id))
    }

    /// Lazy listing of `context` ordered by `last_accessed_at` descending
    pub fn list_by_context(&self, context: MemoryContext, filter: ListFilter) -> NodeListing {
        NodeListing {
            snapshot: self.snapshot(),
            context,
            filter,
        }
    }

    /// Live nodes of `context` keyed by concept / personRef / focus / eventType
    pub fn find_by_key(&self, context: MemoryContext, key: &str) -> Vec<MemoryNode> {
        self.snapshot()
            .find_by_key(context, key)
            .into_iter()
            .map(|r| r.node.clone())
            .collect()
    }

    /// Insert a new edge between live nodes
    pub fn put_edge(&self, edge: MemoryEdge) -> Result<EdgeId> {
        let id = edge.id;
        self.commit(ChangeSet {
            edges: vec![EdgeWrite {
                edge,
                lifecycle: Lifecycle::Active,
                expected: None,
            }],
            ..ChangeSet::default()
        })?;
        Ok(id)
    }

    /// Replace an edge, checking the version read by the caller
    pub fn update_edge(
        &self,
        edge: MemoryEdge,
        lifecycle: Lifecycle,
        expected_version: u64,
    ) -> Result<u64> {
        if !lifecycle.is_live() {
            return Err(MemoryError::validation(format!(
                "edge {} can only be Active or Decayed",
                edge.id
            )));
        }
        let id = edge.id;
        let snapshot = self.commit(ChangeSet {
            edges: vec![EdgeWrite {
                edge,
                lifecycle,
                expected: Some(expected_version),
            }],
            ..ChangeSet::default()
        })?;
        Ok(snapshot.edge(id).map(|r| r.version).unwrap_or(expected_version + 1))
    }

    pub fn get_edge(&self, id: EdgeId) -> Result<EdgeRecord> {
        self.snapshot()
            .edge(id)
            .cloned()
            .ok_or_else(|| MemoryError::not_found(id))
    }

    /// Edges incident to `node`
    pub fn get_edges_between(&self, node: NodeId, direction: Direction) -> Result<Vec<MemoryEdge>> {
        let snapshot = self.snapshot();
        if snapshot.node(node).is_none() {
            return Err(MemoryError::not_found(node));
        }
        Ok(snapshot
            .edges_of(node, direction)
            .into_iter()
            .map(|r| r.edge.clone())
            .collect())
    }

    /// Follow merge redirects to the surviving node
    pub fn resolve(&self, id: NodeId) -> Result<NodeId> {
        self.snapshot().resolve(id)
    }

    /// Lock `ids` for exclusive writing.
    /// Fails with `ConflictRetry` if any id is already locked.
    pub fn lock_subgraph(&self, ids: impl IntoIterator<Item = NodeId>) -> Result<SubgraphLock> {
        let mut lock = SubgraphLock {
            locks: self.locks.clone(),
            ids: BTreeSet::new(),
        };
        for id in ids {
            if lock.ids.contains(&id) {
                continue;
            }
            let acquired = match self.locks.entry(id) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(());
                    true
                }
            };
            if !acquired {
                // dropping `lock` releases what was taken so far
                return Err(MemoryError::conflict(format!("node {} is locked", id)));
            }
            lock.ids.insert(id);
        }
        Ok(lock)
    }

    pub fn is_locked(&self, id: NodeId) -> bool {
        self.locks.contains_key(&id)
    }

    /// The last built vector index, possibly stale
    pub fn vector_index(&self) -> Option<Arc<VectorIndex>> {
        self.index.read().clone()
    }

    /// Build the vector index from the current snapshot. A concurrent
    /// build from a newer snapshot is kept over this one.
    pub fn rebuild_index(&self) -> Arc<VectorIndex> {
        let snapshot = self.snapshot();
        let index = Arc::new(VectorIndex::build(
            snapshot.generation(),
            snapshot.live_nodes().map(|r| &r.node),
        ));
        let mut slot = self.index.write();
        match slot.as_ref() {
            Some(current) if current.generation() > index.generation() => current.clone(),
            _ => {
                *slot = Some(index.clone());
                index
            }
        }
    }

    /// Rebuild unless another caller is already building
    pub fn try_rebuild_index(&self) -> Option<Arc<VectorIndex>> {
        if self.index_building.swap(true, Ordering::SeqCst) {
            return None;
        }
        let index = self.rebuild_index();
        self.index_building.store(false, Ordering::SeqCst);
        Some(index)
    }

    /// Live nodes the current vector index does not cover
    pub fn index_lag(&self) -> usize {
        self.snapshot().unindexed(self.vector_index().as_deref())
    }

    /// Validate and apply `changes` atomically, returning the new snapshot
    pub(crate) fn commit(&self, changes: ChangeSet) -> Result<Arc<GraphSnapshot>> {
        let _writer = self.write_lock.lock();
        let current = self.snapshot();
        if changes.is_empty() {
            return Ok(current);
        }

        for id in changes.touched_nodes(&current) {
            if self.locks.contains_key(&id) && !changes.owned_locks.contains(&id) {
                return Err(MemoryError::conflict(format!(
                    "node {} is locked by consolidation",
                    id
                )));
            }
        }

        let mut next = (*current).clone();
        let mut batch = WriteBatch::default();

        for registered in changes.types {
            batch.put(
                format!("{}{}", TYPE_PREFIX, registered.name),
                bincode::serialize(&registered)?,
            );
            next.types.insert(registered);
        }

        let generation = current.generation + 1;
        for write in changes.nodes {
            let record = stage_node(&next, write)?;
            batch.put(node_key(record.node.id), bincode::serialize(&record)?);
            next.upsert_node(record, generation);
        }

        for (id, expected) in changes.edge_deletes {
            let existing = next.edge(id).ok_or_else(|| MemoryError::not_found(id))?;
            if existing.version != expected {
                return Err(MemoryError::conflict(format!(
                    "edge {} is at version {}, expected {}",
                    id, existing.version, expected
                )));
            }
            batch.delete(edge_key(id));
            next.remove_edge(id);
        }

        for write in changes.edges {
            let record = stage_edge(&next, write)?;
            batch.put(edge_key(record.edge.id), bincode::serialize(&record)?);
            next.upsert_edge(record);
        }

        for redirect in changes.redirects {
            batch.put(redirect_key(redirect.from), bincode::serialize(&redirect)?);
            next.redirects.insert(redirect.from, redirect);
        }
        for from in changes.redirect_deletes {
            batch.delete(redirect_key(from));
            next.redirects.remove(&from);
        }

        for (key, count) in changes.labels {
            let storage_key = format!("{}{}", LABEL_PREFIX, key.storage_key());
            if count == 0 {
                batch.delete(storage_key);
                next.pending_labels.remove(&key);
            } else {
                batch.put(storage_key, bincode::serialize(&(&key, count))?);
                next.pending_labels.insert(key, count);
            }
        }

        next.generation = generation;
        self.write(batch)?;

        let next = Arc::new(next);
        *self.state.write() = next.clone();
        Ok(next)
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(MemoryError::Io(std::io::Error::other("injected write failure")));
            }
        }
        if let Some(db) = &self.db {
            db.write(batch)?;
        }
        Ok(())
    }

    /// Make the next `count` commits fail as if the disk rejected them
    #[cfg(test)]
    pub(crate) fn fail_next_writes(&self, count: u32) {
        self.failing_writes
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }
}

fn stage_node(next: &GraphSnapshot, write: NodeWrite) -> Result<NodeRecord> {
    let id = write.node.id;
    write.node.validate(None).map_err(MemoryError::Validation)?;

    let version = match (write.expected, next.node(id)) {
        (None, None) => 1,
        (None, Some(_)) => {
            return Err(MemoryError::validation(format!("id already assigned: {}", id)))
        }
        (Some(_), None) => return Err(MemoryError::not_found(id)),
        (Some(expected), Some(existing)) => {
            if existing.lifecycle.is_terminal() {
                return Err(MemoryError::stale(
                    id,
                    next.redirect(id).map(|r| r.to),
                ));
            }
            if existing.version != expected {
                return Err(MemoryError::conflict(format!(
                    "node {} is at version {}, expected {}",
                    id, existing.version, expected
                )));
            }
            if existing.node.context() != write.node.context() {
                return Err(MemoryError::validation(format!(
                    "node {} cannot change context from {} to {}",
                    id,
                    existing.node.context(),
                    write.node.context()
                )));
            }
            expected + 1
        }
    };

    Ok(NodeRecord {
        node: write.node,
        lifecycle: write.lifecycle,
        version,
    })
}

fn stage_edge(next: &GraphSnapshot, write: EdgeWrite) -> Result<EdgeRecord> {
    let edge = write.edge;
    edge.validate(&next.types).map_err(MemoryError::Validation)?;
    if write.lifecycle.is_terminal() {
        return Err(MemoryError::validation(format!(
            "edge {} can only be Active or Decayed",
            edge.id
        )));
    }

    for (id, context) in [(edge.from_id, edge.from_context), (edge.to_id, edge.to_context)] {
        match next.node(id) {
            None => {
                return Err(MemoryError::invalid_reference(format!(
                    "endpoint {} does not exist",
                    id
                )))
            }
            Some(record) if !record.lifecycle.is_live() => {
                return Err(MemoryError::invalid_reference(format!(
                    "endpoint {} is {}",
                    id,
                    record.lifecycle.label()
                )))
            }
            Some(record) if record.node.context() != context => {
                return Err(MemoryError::validation(format!(
                    "endpoint {} is {}, edge declares {}",
                    id,
                    record.node.context(),
                    context
                )))
            }
            Some(_) => {}
        }
    }

    if let Some(holder) = next.edge_keys.get(&edge.key()) {
        if *holder != edge.id {
            return Err(MemoryError::validation(format!(
                "edge {} -> {} of type {} already exists",
                edge.from_id, edge.to_id, edge.relationship_type
            )));
        }
    }

    let version = match (write.expected, next.edge(edge.id)) {
        (None, None) => 1,
        (None, Some(_)) => {
            return Err(MemoryError::validation(format!(
                "edge id already assigned: {}",
                edge.id
            )))
        }
        (Some(_), None) => return Err(MemoryError::not_found(edge.id)),
        (Some(expected), Some(existing)) => {
            if existing.version != expected {
                return Err(MemoryError::conflict(format!(
                    "edge {} is at version {}, expected {}",
                    edge.id, existing.version, expected
                )));
            }
            expected + 1
        }
    };

    Ok(EdgeRecord {
        edge,
        lifecycle: write.lifecycle,
        version,
    })
}

fn node_key(id: NodeId) -> String {
    format!("{}{}", NODE_PREFIX, id)
}

fn edge_key(id: EdgeId) -> String {
    format!("{}{}", EDGE_PREFIX, id)
}

fn redirect_key(id: NodeId) -> String {
    format!("{}{}", REDIRECT_PREFIX, id)
}

/// Load every record into a fresh snapshot
fn load_snapshot(db: &DB) -> Result<GraphSnapshot> {
    let mut snapshot = GraphSnapshot::default();
    let mut edges = Vec::new();
    let mut skipped = 0;

    for item in db.iterator(IteratorMode::Start) {
        let (key, value) = item?;
        let key_str = String::from_utf8_lossy(&key);

        if key_str.starts_with(NODE_PREFIX) {
            match bincode::deserialize::<NodeRecord>(&value) {
                Ok(record) => snapshot.upsert_node(record, 0),
                Err(e) => {
                    log::warn!("[store] failed to deserialize {}: {}. Skipping.", key_str, e);
                    skipped += 1;
                }
            }
        } else if key_str.starts_with(EDGE_PREFIX) {
            match bincode::deserialize::<EdgeRecord>(&value) {
                Ok(record) => edges.push(record),
                Err(e) => {
                    log::warn!("[store] failed to deserialize {}: {}. Skipping.", key_str, e);
                    skipped += 1;
                }
            }
        } else if key_str.starts_with(REDIRECT_PREFIX) {
            let redirect: MergeRedirect = bincode::deserialize(&value)?;
            snapshot.redirects.insert(redirect.from, redirect);
        } else if key_str.starts_with(TYPE_PREFIX) {
            let registered: RegisteredType = bincode::deserialize(&value)?;
            snapshot.types.insert(registered);
        } else if key_str.starts_with(LABEL_PREFIX) {
            let (label, count): (LabelKey, u32) = bincode::deserialize(&value)?;
            snapshot.pending_labels.insert(label, count);
        }
    }

    // Edges sort before nodes on disk; attach them once every node is known
    for record in edges {
        let endpoints_live = [record.edge.from_id, record.edge.to_id]
            .iter()
            .all(|id| snapshot.live_node(*id).is_some());
        if endpoints_live {
            snapshot.upsert_edge(record);
        } else {
            log::warn!(
                "[store] edge {} references a missing node. Skipping.",
                record.edge.id
            );
            skipped += 1;
        }
    }

    if skipped > 0 {
        log::warn!("[store] skipped {} records while loading", skipped);
    }
    Ok(snapshot)
}
