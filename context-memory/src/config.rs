//! Engine configuration
//!
//! One immutable structure injected at startup. Every threshold and rate
//! the engine uses lives here with a documented default.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::MemoryContext;
use crate::error::{MemoryError, Result};

/// Longest retention or redirect grace window accepted (about 1000 years)
pub const MAX_WINDOW_SECS: u64 = 1000 * 365 * 24 * 3600;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Length every node and query embedding must have (default: 384)
    pub embedding_dimension: usize,
    /// Texts whose embeddings are cached by the provider wrapper (default: 1024)
    pub embedding_cache_capacity: usize,
    /// Nodes embedded since the vector index was built before a background
    /// rebuild starts (default: 512)
    pub index_refresh_lag: usize,
    pub decay: DecayConfig,
    pub reinforcement: ReinforcementConfig,
    pub inference: InferenceConfig,
    pub consolidation: ConsolidationConfig,
    pub retrieval: RetrievalConfig,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: 384,
            embedding_cache_capacity: 1024,
            index_refresh_lag: 512,
            decay: DecayConfig::default(),
            reinforcement: ReinforcementConfig::default(),
            inference: InferenceConfig::default(),
            consolidation: ConsolidationConfig::default(),
            retrieval: RetrievalConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Builder-style override of the embedding dimension
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.embedding_dimension = dimension;
        self
    }

    /// Reject configurations that would break scoring invariants
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            return Err(MemoryError::validation("embedding_dimension must be > 0"));
        }
        if self.embedding_cache_capacity == 0 {
            return Err(MemoryError::validation("embedding_cache_capacity must be > 0"));
        }
        if self.index_refresh_lag == 0 {
            return Err(MemoryError::validation("index_refresh_lag must be > 0"));
        }

        for context in MemoryContext::ALL {
            let rate = self.decay.rate_per_day(context);
            if !rate.is_finite() || rate < 0.0 {
                return Err(MemoryError::validation(format!(
                    "decay rate for {} must be a non-negative number, got {}",
                    context, rate
                )));
            }
        }
        unit("decay.pruning_floor", self.decay.pruning_floor)?;
        unit("decay.edge_pruning_floor", self.decay.edge_pruning_floor)?;
        window("decay.retention_window_secs", self.decay.retention_window_secs)?;
        if self.reinforcement.base_boost < 0.0 || !self.reinforcement.base_boost.is_finite() {
            return Err(MemoryError::validation("reinforcement.base_boost must be >= 0"));
        }

        unit("inference.similarity_threshold", self.inference.similarity_threshold)?;
        unit("inference.entity_weight", self.inference.entity_weight)?;
        unit("inference.emotional_weight", self.inference.emotional_weight)?;
        if self.inference.entity_weight + self.inference.emotional_weight > 1.0 {
            return Err(MemoryError::validation(
                "inference.entity_weight + inference.emotional_weight must be <= 1",
            ));
        }
        if self.inference.candidate_cap == 0 {
            return Err(MemoryError::validation("inference.candidate_cap must be > 0"));
        }

        unit("consolidation.merge_threshold", self.consolidation.merge_threshold)?;
        window(
            "consolidation.redirect_grace_secs",
            self.consolidation.redirect_grace_secs,
        )?;
        if self.consolidation.schema_evolution_min_occurrences == 0 {
            return Err(MemoryError::validation(
                "consolidation.schema_evolution_min_occurrences must be > 0",
            ));
        }

        let r = &self.retrieval;
        unit("retrieval.alpha", r.alpha)?;
        unit("retrieval.beta", r.beta)?;
        unit("retrieval.gamma", r.gamma)?;
        if (r.alpha + r.beta + r.gamma - 1.0).abs() > 1e-3 {
            return Err(MemoryError::validation(format!(
                "retrieval weights must sum to 1, got {}",
                r.alpha + r.beta + r.gamma
            )));
        }
        if r.top_n == 0 {
            return Err(MemoryError::validation("retrieval.top_n must be > 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(MemoryError::validation("retry.max_attempts must be > 0"));
        }
        Ok(())
    }
}

fn unit(field: &str, value: f32) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MemoryError::validation(format!(
            "{} must be within [0, 1], got {}",
            field, value
        )))
    }
}

fn window(field: &str, secs: u64) -> Result<()> {
    if secs <= MAX_WINDOW_SECS {
        Ok(())
    } else {
        Err(MemoryError::validation(format!(
            "{} must be at most {} seconds, got {}",
            field, MAX_WINDOW_SECS, secs
        )))
    }
}

/// Seconds as a chrono duration, capped at [`MAX_WINDOW_SECS`] so date
/// arithmetic cannot overflow
fn window_duration(secs: u64) -> chrono::Duration {
    // The cap fits in i64
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

/// Time-based decay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    /// λ per context, per day
    pub rates_per_day: BTreeMap<MemoryContext, f64>,
    /// Peak relevance below which a node becomes Decayed (default: 0.05)
    pub pruning_floor: f32,
    /// Strength below which an edge becomes Decayed (default: 0.05)
    pub edge_pruning_floor: f32,
    /// How long a node or edge stays Decayed before it is pruned (default: 7 days)
    pub retention_window_secs: u64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        let rates_per_day = [
            (MemoryContext::Experience, 0.02),
            (MemoryContext::Knowledge, 0.01),
            (MemoryContext::Relationship, 0.005),
            (MemoryContext::Current, 0.1),
        ]
        .into_iter()
        .collect();
        Self {
            rates_per_day,
            pruning_floor: 0.05,
            edge_pruning_floor: 0.05,
            retention_window_secs: 7 * 24 * 3600,
        }
    }
}

impl DecayConfig {
    /// λ for `context`; contexts missing from the map do not decay
    pub fn rate_per_day(&self, context: MemoryContext) -> f64 {
        self.rates_per_day.get(&context).copied().unwrap_or(0.0)
    }

    /// Same λ for every context
    pub fn uniform(rate_per_day: f64) -> Self {
        Self {
            rates_per_day: MemoryContext::ALL
                .into_iter()
                .map(|c| (c, rate_per_day))
                .collect(),
            ..Self::default()
        }
    }

    pub fn retention_window(&self) -> chrono::Duration {
        window_duration(self.retention_window_secs)
    }
}

/// Access-based reinforcement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReinforcementConfig {
    /// First-reinforcement boost; later ones get `base / (1 + count)` (default: 0.2)
    pub base_boost: f32,
}

impl Default for ReinforcementConfig {
    fn default() -> Self {
        Self { base_boost: 0.2 }
    }
}

/// Relationship inference at node creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Minimum cosine similarity to link (default: 0.55)
    pub similarity_threshold: f32,
    /// Candidates examined per context (default: 32)
    pub candidate_cap: usize,
    /// Links created per new node (default: 8)
    pub max_links_per_node: usize,
    /// Share of the remaining headroom earned by entity overlap (default: 0.3)
    pub entity_weight: f32,
    /// Share of the remaining headroom earned by emotional alignment (default: 0.1)
    pub emotional_weight: f32,
    /// Create the reverse edge too (default: true)
    pub symmetric_edges: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.55,
            candidate_cap: 32,
            max_links_per_node: 8,
            entity_weight: 0.3,
            emotional_weight: 0.1,
            symmetric_edges: true,
        }
    }
}

/// Background consolidation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Embedding similarity at which same-context nodes merge (default: 0.92)
    pub merge_threshold: f32,
    /// How long merge redirects are kept (default: 30 days)
    pub redirect_grace_secs: u64,
    /// Occurrences of an unknown link label before it becomes a type (default: 3)
    pub schema_evolution_min_occurrences: u32,
    /// Scheduler interval (default: 1 hour)
    pub interval_secs: u64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.92,
            redirect_grace_secs: 30 * 24 * 3600,
            schema_evolution_min_occurrences: 3,
            interval_secs: 3600,
        }
    }
}

impl ConsolidationConfig {
    pub fn redirect_grace(&self) -> chrono::Duration {
        window_duration(self.redirect_grace_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Retrieval ranking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Weight for semantic similarity (default: 0.5)
    pub alpha: f32,
    /// Weight for graph proximity (default: 0.3)
    pub beta: f32,
    /// Weight for relevance towards the anchor context (default: 0.2)
    pub gamma: f32,
    /// Results per context (default: 5)
    pub top_n: usize,
    /// Graph traversal depth from the anchor seeds (default: 2)
    pub traversal_depth: usize,
    /// Anchor-context nodes used as traversal seeds (default: 3)
    pub seed_count: usize,
    /// Semantic candidates gathered per context (default: 20)
    pub semantic_candidates: usize,
    /// Budget used when the caller gives none (default: 200ms)
    pub default_budget_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            beta: 0.3,
            gamma: 0.2,
            top_n: 5,
            traversal_depth: 2,
            seed_count: 3,
            semantic_candidates: 20,
            default_budget_ms: 200,
        }
    }
}

/// Backoff for optimistic-concurrency conflicts and storage failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 10,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        let delay = (self.initial_delay_ms as f64 * multiplier) as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}
