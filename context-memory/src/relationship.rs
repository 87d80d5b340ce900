//! Cross-context relationship edges and the relationship type registry

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{clamp_unit, in_unit_range, MemoryContext};
use crate::node::NodeId;

/// Unique identifier for edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub Uuid);

impl EdgeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EdgeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EdgeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Grouping of relationship types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeCategory {
    CrossContext,
    WithinContext,
    /// Added at runtime by schema evolution
    Registered,
}

/// Directed relationship kind.
///
/// The twelve cross-context kinds cover each ordered pair of distinct
/// contexts; the four within-context kinds link nodes of the same context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationshipType {
    ExperienceToKnowledge,
    KnowledgeToExperience,
    ExperienceToRelationship,
    RelationshipToExperience,
    KnowledgeToRelationship,
    RelationshipToKnowledge,
    CurrentToExperience,
    ExperienceToCurrent,
    CurrentToKnowledge,
    KnowledgeToCurrent,
    CurrentToRelationship,
    RelationshipToCurrent,
    ExperienceChain,
    KnowledgeHierarchy,
    RelationshipNetwork,
    CurrentSequence,
    /// Type added by schema evolution, looked up in the [`TypeRegistry`]
    Registered(String),
}

impl RelationshipType {
    pub const BUILTIN: [RelationshipType; 16] = [
        Self::ExperienceToKnowledge,
        Self::KnowledgeToExperience,
        Self::ExperienceToRelationship,
        Self::RelationshipToExperience,
        Self::KnowledgeToRelationship,
        Self::RelationshipToKnowledge,
        Self::CurrentToExperience,
        Self::ExperienceToCurrent,
        Self::CurrentToKnowledge,
        Self::KnowledgeToCurrent,
        Self::CurrentToRelationship,
        Self::RelationshipToCurrent,
        Self::ExperienceChain,
        Self::KnowledgeHierarchy,
        Self::RelationshipNetwork,
        Self::CurrentSequence,
    ];

    /// The built-in type for an ordered context pair
    pub fn canonical(from: MemoryContext, to: MemoryContext) -> Self {
        use MemoryContext::*;
        match (from, to) {
            (Experience, Knowledge) => Self::ExperienceToKnowledge,
            (Knowledge, Experience) => Self::KnowledgeToExperience,
            (Experience, Relationship) => Self::ExperienceToRelationship,
            (Relationship, Experience) => Self::RelationshipToExperience,
            (Knowledge, Relationship) => Self::KnowledgeToRelationship,
            (Relationship, Knowledge) => Self::RelationshipToKnowledge,
            (Current, Experience) => Self::CurrentToExperience,
            (Experience, Current) => Self::ExperienceToCurrent,
            (Current, Knowledge) => Self::CurrentToKnowledge,
            (Knowledge, Current) => Self::KnowledgeToCurrent,
            (Current, Relationship) => Self::CurrentToRelationship,
            (Relationship, Current) => Self::RelationshipToCurrent,
            (Experience, Experience) => Self::ExperienceChain,
            (Knowledge, Knowledge) => Self::KnowledgeHierarchy,
            (Relationship, Relationship) => Self::RelationshipNetwork,
            (Current, Current) => Self::CurrentSequence,
        }
    }

    /// Declared (from, to) contexts of a built-in type
    pub fn builtin_endpoints(&self) -> Option<(MemoryContext, MemoryContext)> {
        use MemoryContext::*;
        let pair = match self {
            Self::ExperienceToKnowledge => (Experience, Knowledge),
            Self::KnowledgeToExperience => (Knowledge, Experience),
            Self::ExperienceToRelationship => (Experience, Relationship),
            Self::RelationshipToExperience => (Relationship, Experience),
            Self::KnowledgeToRelationship => (Knowledge, Relationship),
            Self::RelationshipToKnowledge => (Relationship, Knowledge),
            Self::CurrentToExperience => (Current, Experience),
            Self::ExperienceToCurrent => (Experience, Current),
            Self::CurrentToKnowledge => (Current, Knowledge),
            Self::KnowledgeToCurrent => (Knowledge, Current),
            Self::CurrentToRelationship => (Current, Relationship),
            Self::RelationshipToCurrent => (Relationship, Current),
            Self::ExperienceChain => (Experience, Experience),
            Self::KnowledgeHierarchy => (Knowledge, Knowledge),
            Self::RelationshipNetwork => (Relationship, Relationship),
            Self::CurrentSequence => (Current, Current),
            Self::Registered(_) => return None,
        };
        Some(pair)
    }

    pub fn category(&self) -> EdgeCategory {
        match self.builtin_endpoints() {
            Some((from, to)) if from == to => EdgeCategory::WithinContext,
            Some(_) => EdgeCategory::CrossContext,
            None => EdgeCategory::Registered,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Registered(name) => name.clone(),
            builtin => {
                let (from, to) = builtin
                    .builtin_endpoints()
                    .unwrap_or((MemoryContext::Experience, MemoryContext::Experience));
                match builtin {
                    Self::ExperienceChain => "EXPERIENCE_CHAIN".to_string(),
                    Self::KnowledgeHierarchy => "KNOWLEDGE_HIERARCHY".to_string(),
                    Self::RelationshipNetwork => "RELATIONSHIP_NETWORK".to_string(),
                    Self::CurrentSequence => "CURRENT_SEQUENCE".to_string(),
                    _ => format!("{}_TO_{}", from, to),
                }
            }
        }
    }

    /// Parse a built-in type from its name
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = normalize_label(name);
        Self::BUILTIN.into_iter().find(|t| t.name() == normalized)
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// Normalise a free-form relation label: `"works with"` → `"WORKS_WITH"`
pub fn normalize_label(label: &str) -> String {
    label
        .trim()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_uppercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// A relationship type added by schema evolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredType {
    /// Unique type name
    pub name: String,
    /// Normalised link label the type was learned from
    pub label: String,
    pub from_context: MemoryContext,
    pub to_context: MemoryContext,
    pub registered_at: DateTime<Utc>,
    /// Occurrences that triggered the registration
    pub occurrences: u32,
}

/// Unknown link label observed for one ordered context pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelKey {
    pub label: String,
    pub from_context: MemoryContext,
    pub to_context: MemoryContext,
}

impl LabelKey {
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.label, self.from_context, self.to_context)
    }
}

/// Registered relationship types, keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeRegistry {
    types: BTreeMap<String, RegisteredType>,
}

impl TypeRegistry {
    /// (from, to) contexts a type connects, built-in or registered
    pub fn endpoints(&self, rtype: &RelationshipType) -> Option<(MemoryContext, MemoryContext)> {
        match rtype {
            RelationshipType::Registered(name) => self
                .types
                .get(name)
                .map(|t| (t.from_context, t.to_context)),
            builtin => builtin.builtin_endpoints(),
        }
    }

    /// Resolve a link label for a context pair to a known type
    pub fn resolve(
        &self,
        label: &str,
        from: MemoryContext,
        to: MemoryContext,
    ) -> Option<RelationshipType> {
        let normalized = normalize_label(label);
        if let Some(builtin) = RelationshipType::from_name(&normalized) {
            return (builtin.builtin_endpoints() == Some((from, to))).then_some(builtin);
        }
        self.types
            .values()
            .find(|t| t.label == normalized && t.from_context == from && t.to_context == to)
            .map(|t| RelationshipType::Registered(t.name.clone()))
    }

    /// Name for a new type learned from `label` on (from, to). The bare
    /// label when free, otherwise qualified with the context pair.
    pub fn name_for(&self, label: &str, from: MemoryContext, to: MemoryContext) -> String {
        let normalized = normalize_label(label);
        let clashes = RelationshipType::from_name(&normalized).is_some()
            || self.types.get(&normalized).is_some_and(|t| {
                t.from_context != from || t.to_context != to
            });
        if clashes {
            format!("{}__{}_TO_{}", normalized, from, to)
        } else {
            normalized
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn insert(&mut self, registered: RegisteredType) {
        self.types.insert(registered.name.clone(), registered);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredType> {
        self.types.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredType> {
        self.types.values()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Unique key of an edge: (fromId, toId, relationshipType)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeKey {
    pub from_id: NodeId,
    pub to_id: NodeId,
    pub relationship_type: RelationshipType,
}

/// A directed, typed, weighted link between two memory nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEdge {
    pub id: EdgeId,
    pub from_id: NodeId,
    pub from_context: MemoryContext,
    pub to_id: NodeId,
    pub to_context: MemoryContext,
    pub relationship_type: RelationshipType,
    /// Strength (0.0 to 1.0)
    pub strength: f32,
    /// How relevant this link is when reasoning from each context
    pub context_relevance: BTreeMap<MemoryContext, f32>,
    pub reinforcement_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
    /// Instant `strength` was last materialised; lazy decay runs from here
    pub strength_as_of: DateTime<Utc>,
    /// Free-form label the link was proposed with, if any
    #[serde(default)]
    pub label: Option<String>,
}

impl MemoryEdge {
    /// New edge with the canonical type for the endpoint contexts.
    /// Context relevance starts at `strength` for every context.
    pub fn new(
        from: (NodeId, MemoryContext),
        to: (NodeId, MemoryContext),
        strength: f32,
        now: DateTime<Utc>,
    ) -> Self {
        let strength = clamp_unit(strength);
        Self {
            id: EdgeId::new(),
            from_id: from.0,
            from_context: from.1,
            to_id: to.0,
            to_context: to.1,
            relationship_type: RelationshipType::canonical(from.1, to.1),
            strength,
            context_relevance: MemoryContext::ALL.into_iter().map(|c| (c, strength)).collect(),
            reinforcement_count: 0,
            created_at: now,
            last_reinforced_at: now,
            strength_as_of: now,
            label: None,
        }
    }

    pub fn with_type(mut self, relationship_type: RelationshipType) -> Self {
        self.relationship_type = relationship_type;
        self
    }

    pub fn with_context_relevance(mut self, relevance: BTreeMap<MemoryContext, f32>) -> Self {
        self.context_relevance = relevance
            .into_iter()
            .map(|(c, v)| (c, clamp_unit(v)))
            .collect();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            from_id: self.from_id,
            to_id: self.to_id,
            relationship_type: self.relationship_type.clone(),
        }
    }

    /// Relevance of this link from `context`, 0.0 when unset
    pub fn relevance_from(&self, context: MemoryContext) -> f32 {
        self.context_relevance.get(&context).copied().unwrap_or(0.0)
    }

    /// The endpoint opposite `node`, if `node` is an endpoint
    pub fn other_end(&self, node: NodeId) -> Option<(NodeId, MemoryContext)> {
        if self.from_id == node {
            Some((self.to_id, self.to_context))
        } else if self.to_id == node {
            Some((self.from_id, self.from_context))
        } else {
            None
        }
    }

    /// Structural checks that need no store access
    pub fn validate(&self, registry: &TypeRegistry) -> Result<(), String> {
        if self.from_id == self.to_id {
            return Err(format!("self-referential edge on {}", self.from_id));
        }
        if !in_unit_range(self.strength) {
            return Err(format!("strength out of range [0, 1]: {}", self.strength));
        }
        for (context, score) in &self.context_relevance {
            if !in_unit_range(*score) {
                return Err(format!(
                    "context_relevance[{}] out of range [0, 1]: {}",
                    context, score
                ));
            }
        }
        match registry.endpoints(&self.relationship_type) {
            None => Err(format!(
                "unknown relationship type {}",
                self.relationship_type
            )),
            Some(pair) if pair != (self.from_context, self.to_context) => Err(format!(
                "{} does not connect {} to {}",
                self.relationship_type, self.from_context, self.to_context
            )),
            Some(_) => Ok(()),
        }
    }
}
