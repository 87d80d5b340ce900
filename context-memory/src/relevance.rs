//! Relevance decay and reinforcement
//!
//! Scores decay lazily: a stored value is paired with the instant it was
//! last materialised, and readers compute
//! `value * exp(-λ * days_since_materialised)` on the fly. A sweep or a
//! reinforcement writes the decayed value back and moves the anchor to now.
//! Every function here is pure, so reads need no locks.

use chrono::{DateTime, Utc};

use crate::config::{DecayConfig, ReinforcementConfig};
use crate::context::{clamp_unit, MemoryContext, RelevanceVector};
use crate::node::MemoryNode;
use crate::relationship::MemoryEdge;
use crate::temporal::{crossing_time, Lifecycle};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// `exp(-λ * Δdays)`; 1.0 when `to` does not follow `from`
pub fn decay_factor(rate_per_day: f64, from: DateTime<Utc>, to: DateTime<Utc>) -> f32 {
    let elapsed_ms = (to - from).num_milliseconds();
    if elapsed_ms <= 0 || rate_per_day <= 0.0 {
        return 1.0;
    }
    let days = elapsed_ms as f64 / MILLIS_PER_DAY;
    (-rate_per_day * days).exp() as f32
}

/// Relevance vector of `node` decayed to `now`
pub fn effective_relevance(
    node: &MemoryNode,
    decay: &DecayConfig,
    now: DateTime<Utc>,
) -> RelevanceVector {
    let factor = decay_factor(decay.rate_per_day(node.context()), node.relevance_as_of, now);
    node.relevance.scaled(factor)
}

/// Relevance of `node` towards `context` at `now`
pub fn effective_relevance_for(
    node: &MemoryNode,
    context: MemoryContext,
    decay: &DecayConfig,
    now: DateTime<Utc>,
) -> f32 {
    let factor = decay_factor(decay.rate_per_day(node.context()), node.relevance_as_of, now);
    clamp_unit(node.relevance.get(context) * factor)
}

/// Strength of `edge` decayed to `now`, using the source context's rate
pub fn effective_strength(edge: &MemoryEdge, decay: &DecayConfig, now: DateTime<Utc>) -> f32 {
    let factor = decay_factor(decay.rate_per_day(edge.from_context), edge.strength_as_of, now);
    clamp_unit(edge.strength * factor)
}

/// Write decayed relevance back into `node` and move its anchor to `now`
pub fn materialize_node(node: &mut MemoryNode, decay: &DecayConfig, now: DateTime<Utc>) {
    if now <= node.relevance_as_of {
        return;
    }
    node.relevance = effective_relevance(node, decay, now);
    node.relevance_as_of = now;
}

/// Write decayed strength back into `edge` and move its anchor to `now`
pub fn materialize_edge(edge: &mut MemoryEdge, decay: &DecayConfig, now: DateTime<Utc>) {
    if now <= edge.strength_as_of {
        return;
    }
    edge.strength = effective_strength(edge, decay, now);
    edge.strength_as_of = now;
}

/// Boost earned by the reinforcement after `count` earlier ones
pub fn boost(base: f32, count: u32) -> f32 {
    base / (1.0 + count as f32)
}

/// Lifecycle `node` should be in at `now`, given its current one.
///
/// An Active node whose peak relevance has fallen below the floor becomes
/// Decayed as of the instant it crossed. Other states are left alone.
pub fn node_lifecycle(
    node: &MemoryNode,
    current: Lifecycle,
    decay: &DecayConfig,
    now: DateTime<Utc>,
) -> Lifecycle {
    if !current.is_active() {
        return current;
    }
    let peak = effective_relevance(node, decay, now).peak();
    if peak >= decay.pruning_floor {
        return current;
    }
    let since = crossing_time(
        node.relevance.peak(),
        decay.pruning_floor,
        decay.rate_per_day(node.context()),
        node.relevance_as_of,
    )
    .map(|t| t.min(now))
    .unwrap_or(now);
    Lifecycle::Decayed { since }
}

/// Lifecycle `edge` should be in at `now`, mirroring [`node_lifecycle`]
pub fn edge_lifecycle(
    edge: &MemoryEdge,
    current: Lifecycle,
    decay: &DecayConfig,
    now: DateTime<Utc>,
) -> Lifecycle {
    if !current.is_active() {
        return current;
    }
    if effective_strength(edge, decay, now) >= decay.edge_pruning_floor {
        return current;
    }
    let since = crossing_time(
        edge.strength,
        decay.edge_pruning_floor,
        decay.rate_per_day(edge.from_context),
        edge.strength_as_of,
    )
    .map(|t| t.min(now))
    .unwrap_or(now);
    Lifecycle::Decayed { since }
}

/// Apply one reinforcement to `node` and return its new lifecycle.
///
/// Materialises decay first, then adds the diminishing boost to every
/// relevance entry. A Decayed node that climbs back over the floor
/// becomes Active again.
pub fn reinforce_node(
    node: &mut MemoryNode,
    current: Lifecycle,
    decay: &DecayConfig,
    reinforcement: &ReinforcementConfig,
    now: DateTime<Utc>,
) -> Lifecycle {
    materialize_node(node, decay, now);
    let amount = boost(reinforcement.base_boost, node.reinforcement_count);
    node.relevance = node.relevance.boosted(amount);
    node.reinforcement_count = node.reinforcement_count.saturating_add(1);
    node.relevance_as_of = node.relevance_as_of.max(now);
    node.last_accessed_at = node.last_accessed_at.max(now);

    match current {
        Lifecycle::Decayed { .. } if node.relevance.peak() >= decay.pruning_floor => {
            Lifecycle::Active
        }
        other => other,
    }
}

/// Apply one reinforcement to `edge` and return its new lifecycle
pub fn reinforce_edge(
    edge: &mut MemoryEdge,
    current: Lifecycle,
    decay: &DecayConfig,
    reinforcement: &ReinforcementConfig,
    now: DateTime<Utc>,
) -> Lifecycle {
    materialize_edge(edge, decay, now);
    let amount = boost(reinforcement.base_boost, edge.reinforcement_count);
    edge.strength = clamp_unit(edge.strength + amount);
    edge.reinforcement_count = edge.reinforcement_count.saturating_add(1);
    edge.strength_as_of = edge.strength_as_of.max(now);
    edge.last_reinforced_at = edge.last_reinforced_at.max(now);

    match current {
        Lifecycle::Decayed { .. } if edge.strength >= decay.edge_pruning_floor => Lifecycle::Active,
        other => other,
    }
}
