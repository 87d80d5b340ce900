//! Memory contexts and per-node relevance vectors

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Usage-oriented memory category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryContext {
    /// What happened + what was learned from it
    Experience,
    /// What is known + how it is used
    Knowledge,
    /// Who is known + how the interaction goes
    Relationship,
    /// What is in focus right now
    Current,
}

impl MemoryContext {
    pub const ALL: [MemoryContext; 4] = [
        MemoryContext::Experience,
        MemoryContext::Knowledge,
        MemoryContext::Relationship,
        MemoryContext::Current,
    ];

    /// The three contexts other than `self`
    pub fn others(self) -> impl Iterator<Item = MemoryContext> {
        Self::ALL.into_iter().filter(move |c| *c != self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Experience => "EXPERIENCE",
            Self::Knowledge => "KNOWLEDGE",
            Self::Relationship => "RELATIONSHIP",
            Self::Current => "CURRENT",
        }
    }

    /// Default relevance a fresh node of this context has towards the others
    pub fn default_cross_relevance(self) -> f32 {
        match self {
            Self::Current => 0.8,
            _ => 0.5,
        }
    }
}

impl std::fmt::Display for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EXPERIENCE" => Ok(Self::Experience),
            "KNOWLEDGE" => Ok(Self::Knowledge),
            "RELATIONSHIP" => Ok(Self::Relationship),
            "CURRENT" => Ok(Self::Current),
            other => Err(format!("unknown memory context: {}", other)),
        }
    }
}

/// How relevant a node is when retrieval is anchored in each *other* context.
///
/// Never holds an entry for the owning node's own context; the node store
/// rejects vectors that do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelevanceVector(BTreeMap<MemoryContext, f32>);

impl RelevanceVector {
    /// Vector with `value` for each of the three contexts other than `owner`
    pub fn uniform(owner: MemoryContext, value: f32) -> Self {
        let value = value.clamp(0.0, 1.0);
        Self(owner.others().map(|c| (c, value)).collect())
    }

    /// Score for `context`, 0.0 when absent
    pub fn get(&self, context: MemoryContext) -> f32 {
        self.0.get(&context).copied().unwrap_or(0.0)
    }

    /// Set a score, clamped to [0, 1]
    pub fn set(&mut self, context: MemoryContext, value: f32) {
        self.0.insert(context, clamp_unit(value));
    }

    pub fn contains(&self, context: MemoryContext) -> bool {
        self.0.contains_key(&context)
    }

    pub fn iter(&self) -> impl Iterator<Item = (MemoryContext, f32)> + '_ {
        self.0.iter().map(|(c, v)| (*c, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Highest score across contexts
    pub fn peak(&self) -> f32 {
        self.0.values().copied().fold(0.0, f32::max)
    }

    /// Mean score across contexts (aggregate relevance)
    pub fn mean(&self) -> f32 {
        if self.0.is_empty() {
            return 0.0;
        }
        self.0.values().sum::<f32>() / self.0.len() as f32
    }

    /// Copy with every score multiplied by `factor` and clamped
    pub fn scaled(&self, factor: f32) -> Self {
        Self(
            self.0
                .iter()
                .map(|(c, v)| (*c, clamp_unit(v * factor)))
                .collect(),
        )
    }

    /// Element-wise maximum with `other`
    pub fn max_with(&mut self, other: &RelevanceVector) {
        for (context, value) in other.iter() {
            let entry = self.0.entry(context).or_insert(0.0);
            *entry = entry.max(clamp_unit(value));
        }
    }

    /// Add `boost` to every score, saturating at 1.0
    pub fn boosted(&self, boost: f32) -> Self {
        Self(
            self.0
                .iter()
                .map(|(c, v)| (*c, clamp_unit(v + boost)))
                .collect(),
        )
    }

    pub(crate) fn remove(&mut self, context: MemoryContext) {
        self.0.remove(&context);
    }
}

impl FromIterator<(MemoryContext, f32)> for RelevanceVector {
    fn from_iter<T: IntoIterator<Item = (MemoryContext, f32)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(c, v)| (c, clamp_unit(v))).collect())
    }
}

/// Clamp a score into [0, 1]; NaN collapses to 0
pub fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Whether `value` is a finite score inside [0, 1]
pub fn in_unit_range(value: f32) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}
