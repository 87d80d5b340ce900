//! Memory node types and builders
//!
//! A node is a shared envelope (id, content, timestamps, embedding,
//! relevance vector) plus one of four context-specific detail variants.
//! The node's context is derived from its variant, so it cannot change
//! after creation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{in_unit_range, MemoryContext, RelevanceVector};

/// Unique identifier for memory nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Create a new random NodeId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Experience: an event and what was learned from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceDetails {
    pub event_type: String,
    /// Entity references of the people involved
    #[serde(default)]
    pub participants: BTreeSet<String>,
    #[serde(default)]
    pub lessons_learned: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub insights: Vec<String>,
}

/// Knowledge: a concept and how it is applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDetails {
    pub concept: String,
    pub definition: String,
    #[serde(default)]
    pub how_to_use: Vec<String>,
    #[serde(default)]
    pub understanding_level: f32,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub related_concepts: BTreeSet<String>,
}

/// Relationship: a person and how the interaction goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDetails {
    pub person_ref: String,
    pub relationship_type: String,
    #[serde(default = "default_trust")]
    pub trust_level: f32,
    #[serde(default)]
    pub personality_traits: BTreeSet<String>,
    #[serde(default)]
    pub interests: BTreeSet<String>,
}

fn default_trust() -> f32 {
    0.5
}

/// Current: present focus and state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentDetails {
    pub focus: String,
    pub time_context: String,
    /// Emotional state, -1 (negative) to 1 (positive)
    #[serde(default)]
    pub mood: f32,
    #[serde(default)]
    pub stress_level: f32,
    #[serde(default)]
    pub recent_experience_refs: Vec<NodeId>,
    #[serde(default)]
    pub goals: Vec<String>,
}

/// Context-specific attributes; the variant is the node's context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDetails {
    Experience(ExperienceDetails),
    Knowledge(KnowledgeDetails),
    Relationship(RelationshipDetails),
    Current(CurrentDetails),
}

impl NodeDetails {
    pub fn context(&self) -> MemoryContext {
        match self {
            Self::Experience(_) => MemoryContext::Experience,
            Self::Knowledge(_) => MemoryContext::Knowledge,
            Self::Relationship(_) => MemoryContext::Relationship,
            Self::Current(_) => MemoryContext::Current,
        }
    }

    /// Indexed lookup key: eventType / concept / personRef / focus
    pub fn key(&self) -> &str {
        match self {
            Self::Experience(d) => &d.event_type,
            Self::Knowledge(d) => &d.concept,
            Self::Relationship(d) => &d.person_ref,
            Self::Current(d) => &d.focus,
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Experience(d) => {
                require_text("event_type", &d.event_type)?;
            }
            Self::Knowledge(d) => {
                require_text("concept", &d.concept)?;
                require_text("definition", &d.definition)?;
                require_unit("understanding_level", d.understanding_level)?;
            }
            Self::Relationship(d) => {
                require_text("person_ref", &d.person_ref)?;
                require_text("relationship_type", &d.relationship_type)?;
                require_unit("trust_level", d.trust_level)?;
            }
            Self::Current(d) => {
                require_text("focus", &d.focus)?;
                require_text("time_context", &d.time_context)?;
                require_unit("stress_level", d.stress_level)?;
                if !d.mood.is_finite() || !(-1.0..=1.0).contains(&d.mood) {
                    return Err(format!("mood out of range [-1, 1]: {}", d.mood));
                }
            }
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("missing required field: {}", field))
    } else {
        Ok(())
    }
}

fn require_unit(field: &str, value: f32) -> Result<(), String> {
    if in_unit_range(value) {
        Ok(())
    } else {
        Err(format!("{} out of range [0, 1]: {}", field, value))
    }
}

/// A memory node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryNode {
    /// Unique identifier, immutable once assigned
    pub id: NodeId,
    /// The memory content
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Emotional weight (0.0 to 1.0)
    pub emotional_weight: f32,
    /// Fixed-length embedding vector
    pub embedding: Vec<f32>,
    /// Relevance towards the other three contexts
    pub relevance: RelevanceVector,
    /// Instant the stored relevance scores were last materialised.
    /// Lazy decay runs from here.
    pub relevance_as_of: DateTime<Utc>,
    /// Times this node was used in a response
    pub reinforcement_count: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Context-specific attributes
    pub details: NodeDetails,
}

impl MemoryNode {
    /// Create a new builder for MemoryNode
    pub fn builder() -> MemoryNodeBuilder {
        MemoryNodeBuilder::new()
    }

    pub fn context(&self) -> MemoryContext {
        self.details.context()
    }

    /// Lowercased entity references used for overlap scoring
    pub fn entities(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        match &self.details {
            NodeDetails::Experience(d) => {
                out.extend(d.participants.iter().map(|p| p.to_lowercase()));
            }
            NodeDetails::Knowledge(d) => {
                out.insert(d.concept.to_lowercase());
                out.extend(d.related_concepts.iter().map(|c| c.to_lowercase()));
            }
            NodeDetails::Relationship(d) => {
                out.insert(d.person_ref.to_lowercase());
            }
            NodeDetails::Current(d) => {
                out.insert(d.focus.to_lowercase());
            }
        }
        out.retain(|e| !e.trim().is_empty());
        out
    }

    /// Get the searchable text for this memory
    pub fn searchable_text(&self) -> String {
        format!("{} {} {}", self.details.key(), self.content, self.tags.join(" "))
    }

    /// Check field presence and scalar ranges.
    ///
    /// `dimension` enforces the embedding length when given.
    pub fn validate(&self, dimension: Option<usize>) -> Result<(), String> {
        require_text("content", &self.content)?;
        require_unit("emotional_weight", self.emotional_weight)?;

        if self.embedding.is_empty() {
            return Err("missing required field: embedding".to_string());
        }
        if let Some(dim) = dimension {
            if self.embedding.len() != dim {
                return Err(format!(
                    "embedding has {} dimensions, expected {}",
                    self.embedding.len(),
                    dim
                ));
            }
        }
        if self.embedding.iter().any(|x| !x.is_finite()) {
            return Err("embedding contains non-finite values".to_string());
        }

        let own = self.context();
        if self.relevance.contains(own) {
            return Err(format!("relevance vector holds an entry for its own context {}", own));
        }
        for (context, score) in self.relevance.iter() {
            if !in_unit_range(score) {
                return Err(format!("relevance[{}] out of range [0, 1]: {}", context, score));
            }
        }
        if self.last_accessed_at < self.created_at {
            return Err("last_accessed_at precedes created_at".to_string());
        }

        self.details.validate()
    }
}

/// Builder for MemoryNode with fluent API
#[derive(Debug, Default, Clone)]
pub struct MemoryNodeBuilder {
    id: Option<NodeId>,
    details: Option<NodeDetails>,
    content: Option<String>,
    created_at: Option<DateTime<Utc>>,
    emotional_weight: f32,
    embedding: Option<Vec<f32>>,
    relevance: BTreeMap<MemoryContext, f32>,
    tags: Vec<String>,
}

impl MemoryNodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node ID (auto-generated if not set)
    pub fn id(mut self, id: NodeId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set as an experience
    pub fn experience(mut self, event_type: impl Into<String>) -> Self {
        self.details = Some(NodeDetails::Experience(ExperienceDetails {
            event_type: event_type.into(),
            participants: BTreeSet::new(),
            lessons_learned: vec![],
            location: None,
            insights: vec![],
        }));
        self
    }

    /// Set as knowledge
    pub fn knowledge(mut self, concept: impl Into<String>, definition: impl Into<String>) -> Self {
        self.details = Some(NodeDetails::Knowledge(KnowledgeDetails {
            concept: concept.into(),
            definition: definition.into(),
            how_to_use: vec![],
            understanding_level: 0.0,
            category: None,
            related_concepts: BTreeSet::new(),
        }));
        self
    }

    /// Set as a relationship
    pub fn relationship(
        mut self,
        person_ref: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        self.details = Some(NodeDetails::Relationship(RelationshipDetails {
            person_ref: person_ref.into(),
            relationship_type: relationship_type.into(),
            trust_level: default_trust(),
            personality_traits: BTreeSet::new(),
            interests: BTreeSet::new(),
        }));
        self
    }

    /// Set as current focus
    pub fn current(mut self, focus: impl Into<String>, time_context: impl Into<String>) -> Self {
        self.details = Some(NodeDetails::Current(CurrentDetails {
            focus: focus.into(),
            time_context: time_context.into(),
            mood: 0.0,
            stress_level: 0.0,
            recent_experience_refs: vec![],
            goals: vec![],
        }));
        self
    }

    /// Set the details directly
    pub fn details(mut self, details: NodeDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// Add a participant (experience only)
    pub fn participant(mut self, entity: impl Into<String>) -> Self {
        if let Some(NodeDetails::Experience(d)) = self.details.as_mut() {
            d.participants.insert(entity.into());
        }
        self
    }

    /// Add a lesson (experience only)
    pub fn lesson(mut self, lesson: impl Into<String>) -> Self {
        if let Some(NodeDetails::Experience(d)) = self.details.as_mut() {
            d.lessons_learned.push(lesson.into());
        }
        self
    }

    /// Add a usage note (knowledge only)
    pub fn how_to_use(mut self, usage: impl Into<String>) -> Self {
        if let Some(NodeDetails::Knowledge(d)) = self.details.as_mut() {
            d.how_to_use.push(usage.into());
        }
        self
    }

    /// Set understanding level (knowledge only)
    pub fn understanding(mut self, level: f32) -> Self {
        if let Some(NodeDetails::Knowledge(d)) = self.details.as_mut() {
            d.understanding_level = level;
        }
        self
    }

    /// Set trust level (relationship only)
    pub fn trust(mut self, level: f32) -> Self {
        if let Some(NodeDetails::Relationship(d)) = self.details.as_mut() {
            d.trust_level = level;
        }
        self
    }

    /// Add a personality trait (relationship only)
    pub fn personality_trait(mut self, personality_trait: impl Into<String>) -> Self {
        if let Some(NodeDetails::Relationship(d)) = self.details.as_mut() {
            d.personality_traits.insert(personality_trait.into());
        }
        self
    }

    /// Set the content
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set the creation time (defaults to now). Also the initial access time.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Set emotional weight
    pub fn emotional_weight(mut self, weight: f32) -> Self {
        self.emotional_weight = weight;
        self
    }

    /// Set embedding vector
    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Whether an embedding was supplied
    pub fn has_embedding(&self) -> bool {
        self.embedding.is_some()
    }

    /// Text used to embed the node when no embedding was supplied
    pub fn embedding_text(&self) -> String {
        let key = self.details.as_ref().map(|d| d.key()).unwrap_or_default();
        format!("{} {}", key, self.content.as_deref().unwrap_or_default())
    }

    /// Set relevance towards another context
    pub fn relevance(mut self, context: MemoryContext, score: f32) -> Self {
        self.relevance.insert(context, score);
        self
    }

    /// Add a tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Context of the node being built, if details were set
    pub fn context(&self) -> Option<MemoryContext> {
        self.details.as_ref().map(|d| d.context())
    }

    /// Build the MemoryNode.
    ///
    /// Unspecified relevance entries default per context; out-of-range
    /// values are rejected, not clamped.
    pub fn build(self) -> Result<MemoryNode, MemoryNodeBuilderError> {
        let details = self.details.ok_or(MemoryNodeBuilderError::MissingDetails)?;
        let content = self.content.ok_or(MemoryNodeBuilderError::MissingContent)?;
        let embedding = self.embedding.ok_or(MemoryNodeBuilderError::MissingEmbedding)?;

        let context = details.context();
        let mut relevance = RelevanceVector::uniform(context, context.default_cross_relevance());
        for (ctx, score) in &self.relevance {
            if *ctx == context {
                return Err(MemoryNodeBuilderError::Invalid(format!(
                    "relevance vector holds an entry for its own context {}",
                    context
                )));
            }
            if !in_unit_range(*score) {
                return Err(MemoryNodeBuilderError::Invalid(format!(
                    "relevance[{}] out of range [0, 1]: {}",
                    ctx, score
                )));
            }
            relevance.set(*ctx, *score);
        }

        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let node = MemoryNode {
            id: self.id.unwrap_or_default(),
            content: content.trim().to_string(),
            created_at,
            last_accessed_at: created_at,
            emotional_weight: self.emotional_weight,
            embedding,
            relevance,
            relevance_as_of: created_at,
            reinforcement_count: 0,
            tags: self.tags,
            details,
        };

        node.validate(None).map_err(MemoryNodeBuilderError::Invalid)?;
        Ok(node)
    }
}

/// Errors that can occur when building a MemoryNode
#[derive(Debug, thiserror::Error)]
pub enum MemoryNodeBuilderError {
    #[error("Missing required field: details")]
    MissingDetails,
    #[error("Missing required field: content")]
    MissingContent,
    #[error("Missing required field: embedding")]
    MissingEmbedding,
    #[error("{0}")]
    Invalid(String),
}

/// A candidate node proposed by the extraction collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProposal {
    /// Declared context; must agree with `details`
    pub context: MemoryContext,
    pub details: NodeDetails,
    pub content: String,
    #[serde(default)]
    pub emotional_weight: f32,
    /// Precomputed embedding; embedded from `content` when absent
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub relevance: BTreeMap<MemoryContext, f32>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NodeProposal {
    pub fn new(details: NodeDetails, content: impl Into<String>) -> Self {
        Self {
            context: details.context(),
            details,
            content: content.into(),
            emotional_weight: 0.0,
            embedding: None,
            relevance: BTreeMap::new(),
            tags: vec![],
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_relevance(mut self, context: MemoryContext, score: f32) -> Self {
        self.relevance.insert(context, score);
        self
    }

    pub fn with_emotional_weight(mut self, weight: f32) -> Self {
        self.emotional_weight = weight;
        self
    }

    /// Turn the proposal into a builder, checking the declared context
    pub fn into_builder(self) -> Result<MemoryNodeBuilder, MemoryNodeBuilderError> {
        if self.context != self.details.context() {
            return Err(MemoryNodeBuilderError::Invalid(format!(
                "declared context {} does not match {} attributes",
                self.context,
                self.details.context()
            )));
        }
        let mut builder = MemoryNode::builder()
            .details(self.details)
            .content(self.content)
            .emotional_weight(self.emotional_weight);
        if let Some(embedding) = self.embedding {
            builder = builder.embedding(embedding);
        }
        for (context, score) in self.relevance {
            builder = builder.relevance(context, score);
        }
        for tag in self.tags {
            builder = builder.tag(tag);
        }
        Ok(builder)
    }
}
