//! Relationship inference at node creation
//!
//! A new node is compared against the Active nodes of the other three
//! contexts. Candidates whose embedding similarity clears the threshold are
//! linked with a strength that starts at the similarity and earns part of
//! the remaining headroom from shared entities and emotional alignment:
//!
//! `strength = sim + (1 - sim) * (entity_weight * overlap + emotional_weight * alignment)`
//!
//! so a link is never weaker than the similarity that justified it.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::config::{DecayConfig, InferenceConfig};
use crate::context::{clamp_unit, MemoryContext};
use crate::index::VectorIndex;
use crate::node::{MemoryNode, NodeId};
use crate::relationship::MemoryEdge;
use crate::relevance::effective_relevance;
use crate::storage::GraphSnapshot;

/// A link the engine decided to create
#[derive(Debug, Clone, PartialEq)]
pub struct InferredLink {
    pub target: NodeId,
    pub target_context: MemoryContext,
    pub similarity: f32,
    pub entity_overlap: f32,
    pub emotional_alignment: f32,
    pub strength: f32,
}

/// Share of entities the two nodes have in common.
///
/// The larger of the Jaccard index of their entity sets and the fraction of
/// each node's entities mentioned in the other's content.
pub fn entity_overlap(a: &MemoryNode, b: &MemoryNode) -> f32 {
    let ea = a.entities();
    let eb = b.entities();
    if ea.is_empty() && eb.is_empty() {
        return 0.0;
    }

    let shared = ea.intersection(&eb).count();
    let union = ea.union(&eb).count();
    let jaccard = if union == 0 {
        0.0
    } else {
        shared as f32 / union as f32
    };

    let a_text = a.searchable_text().to_lowercase();
    let b_text = b.searchable_text().to_lowercase();
    let mentioned = ea.iter().filter(|e| b_text.contains(e.as_str())).count()
        + eb.iter().filter(|e| a_text.contains(e.as_str())).count();
    let mention_ratio = mentioned as f32 / (ea.len() + eb.len()) as f32;

    clamp_unit(jaccard.max(mention_ratio))
}

/// 1.0 for identical emotional weights, 0.0 for opposite extremes
pub fn emotional_alignment(a: &MemoryNode, b: &MemoryNode) -> f32 {
    clamp_unit(1.0 - (a.emotional_weight - b.emotional_weight).abs())
}

/// Combine the three signals into an edge strength
pub fn link_strength(
    similarity: f32,
    entity_overlap: f32,
    emotional_alignment: f32,
    config: &InferenceConfig,
) -> f32 {
    let similarity = clamp_unit(similarity);
    let bonus = config.entity_weight * entity_overlap + config.emotional_weight * emotional_alignment;
    clamp_unit(similarity + (1.0 - similarity) * clamp_unit(bonus))
}

/// Per-context relevance of a link between `a` and `b`: the mean of the two
/// nodes' relevance towards each context, a node counting fully towards its
/// own context
pub fn seed_context_relevance(
    a: &MemoryNode,
    b: &MemoryNode,
    decay: &DecayConfig,
    now: DateTime<Utc>,
) -> BTreeMap<MemoryContext, f32> {
    let ra = effective_relevance(a, decay, now);
    let rb = effective_relevance(b, decay, now);
    let towards = |node: &MemoryNode, rel: &crate::context::RelevanceVector, c: MemoryContext| {
        if node.context() == c {
            1.0
        } else {
            rel.get(c)
        }
    };
    MemoryContext::ALL
        .into_iter()
        .map(|c| (c, clamp_unit((towards(a, &ra, c) + towards(b, &rb, c)) / 2.0)))
        .collect()
}

/// Choose the nodes `node` should link to.
///
/// Examines at most `candidate_cap` of the most similar Active nodes per
/// other context. Only candidates strictly above the similarity threshold
/// qualify; ties go to the higher similarity, then the more recently
/// created node. An empty result is a normal outcome.
pub fn infer_links(
    snapshot: &GraphSnapshot,
    index: Option<&VectorIndex>,
    node: &MemoryNode,
    config: &InferenceConfig,
) -> Vec<InferredLink> {
    let mut scored: Vec<(InferredLink, DateTime<Utc>)> = Vec::new();
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();

    for context in node.context().others() {
        for (id, similarity) in
            snapshot.nearest(context, &node.embedding, config.candidate_cap, index, false)
        {
            if similarity <= config.similarity_threshold || !seen.insert(id) {
                continue;
            }
            let Some(record) = snapshot.node(id) else {
                continue;
            };
            let candidate = &record.node;
            let overlap = entity_overlap(node, candidate);
            let alignment = emotional_alignment(node, candidate);
            scored.push((
                InferredLink {
                    target: id,
                    target_context: context,
                    similarity,
                    entity_overlap: overlap,
                    emotional_alignment: alignment,
                    strength: link_strength(similarity, overlap, alignment, config),
                },
                candidate.created_at,
            ));
        }
    }

    scored.sort_by(|a, b| {
        b.0.similarity
            .partial_cmp(&a.0.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.0.target.cmp(&b.0.target))
    });
    scored.truncate(config.max_links_per_node);
    scored.into_iter().map(|(link, _)| link).collect()
}

/// Edges realising `link` from `node`: the forward edge and, with
/// symmetric edges enabled, its reverse
pub fn edges_for(
    node: &MemoryNode,
    target: &MemoryNode,
    link: &InferredLink,
    config: &InferenceConfig,
    decay: &DecayConfig,
    now: DateTime<Utc>,
) -> Vec<MemoryEdge> {
    let relevance = seed_context_relevance(node, target, decay, now);
    let forward = MemoryEdge::new(
        (node.id, node.context()),
        (target.id, target.context()),
        link.strength,
        now,
    )
    .with_context_relevance(relevance.clone());

    if !config.symmetric_edges {
        return vec![forward];
    }
    let reverse = MemoryEdge::new(
        (target.id, target.context()),
        (node.id, node.context()),
        link.strength,
        now,
    )
    .with_context_relevance(relevance);
    vec![forward, reverse]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationship::RelationshipType;
    use crate::storage::GraphStore;

    fn experience() -> MemoryNode {
        MemoryNode::builder()
            .experience("presentation")
            .participant("John")
            .content("John helped with presentation")
            .emotional_weight(0.7)
            .embedding(vec![0.9, 0.3, 0.1])
            .relevance(MemoryContext::Knowledge, 0.8)
            .relevance(MemoryContext::Relationship, 0.9)
            .build()
            .unwrap()
    }

    fn relationship() -> MemoryNode {
        MemoryNode::builder()
            .relationship("John", "colleague")
            .trust(0.9)
            .content("John, colleague")
            .emotional_weight(0.6)
            .embedding(vec![0.8, 0.4, 0.1])
            .build()
            .unwrap()
    }

    #[test]
    fn test_entity_overlap_by_shared_person() {
        let overlap = entity_overlap(&experience(), &relationship());
        assert!((overlap - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_entity_overlap_disjoint() {
        let other = MemoryNode::builder()
            .knowledge("Python debugging", "finding bugs in python code")
            .content("breakpoints and tracebacks")
            .embedding(vec![0.1, 0.9, 0.0])
            .build()
            .unwrap();
        assert_eq!(entity_overlap(&experience(), &other), 0.0);
    }

    #[test]
    fn test_strength_never_below_similarity() {
        let config = InferenceConfig::default();
        for sim in [0.0, 0.3, 0.56, 0.9, 1.0] {
            for overlap in [0.0, 0.5, 1.0] {
                for alignment in [0.0, 1.0] {
                    let s = link_strength(sim, overlap, alignment, &config);
                    assert!(s >= sim && s <= 1.0, "{} -> {}", sim, s);
                }
            }
        }
    }

    #[test]
    fn test_context_relevance_counts_own_context_fully() {
        let a = experience();
        let b = relationship();
        let relevance = seed_context_relevance(&a, &b, &DecayConfig::default(), a.created_at);
        // Experience: a is its own (1.0), b defaults to 0.5
        assert!((relevance[&MemoryContext::Experience] - 0.75).abs() < 1e-6);
        // Relationship: a holds 0.9, b is its own (1.0)
        assert!((relevance[&MemoryContext::Relationship] - 0.95).abs() < 1e-6);
        assert_eq!(relevance.len(), 4);
    }

    #[test]
    fn test_infer_links_respects_threshold_and_cap() {
        let store = GraphStore::in_memory();
        let rel = relationship();
        store.put(rel.clone()).unwrap();
        let unrelated = MemoryNode::builder()
            .knowledge("gardening", "growing plants")
            .content("tomatoes need sun")
            .embedding(vec![0.0, 0.0, 1.0])
            .build()
            .unwrap();
        store.put(unrelated).unwrap();

        let exp = experience();
        let config = InferenceConfig::default();
        let links = infer_links(&store.snapshot(), None, &exp, &config);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, rel.id);
        assert!(links[0].strength > config.similarity_threshold);

        let capped = InferenceConfig {
            max_links_per_node: 0,
            ..InferenceConfig::default()
        };
        assert!(infer_links(&store.snapshot(), None, &exp, &capped).is_empty());
    }

    #[test]
    fn test_no_candidate_is_not_an_error() {
        let store = GraphStore::in_memory();
        let links = infer_links(&store.snapshot(), None, &experience(), &InferenceConfig::default());
        assert!(links.is_empty());
    }

    #[test]
    fn test_symmetric_edges() {
        let exp = experience();
        let rel = relationship();
        let link = InferredLink {
            target: rel.id,
            target_context: MemoryContext::Relationship,
            similarity: 0.9,
            entity_overlap: 1.0,
            emotional_alignment: 0.9,
            strength: 0.95,
        };
        let decay = DecayConfig::default();
        let now = Utc::now();

        let edges = edges_for(&exp, &rel, &link, &InferenceConfig::default(), &decay, now);
        assert_eq!(edges.len(), 2);
        assert_eq!(
            edges[0].relationship_type,
            RelationshipType::ExperienceToRelationship
        );
        assert_eq!(
            edges[1].relationship_type,
            RelationshipType::RelationshipToExperience
        );

        let one_way = InferenceConfig {
            symmetric_edges: false,
            ..InferenceConfig::default()
        };
        assert_eq!(edges_for(&exp, &rel, &link, &one_way, &decay, now).len(), 1);
    }
}
