//! Lifecycle metadata for nodes and edges
//!
//! A node written to the store is **Active**. It becomes **Decayed** when its
//! peak relevance drops below the pruning floor, and ends either **Pruned**
//! (tombstoned, id still reserved) or **Merged** into a surviving duplicate.
//! Edges share the Active/Decayed half; they are deleted rather than
//! tombstoned.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// Lifecycle state of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Active,
    /// Peak relevance crossed the pruning floor at `since`
    Decayed { since: DateTime<Utc> },
    /// Tombstoned; excluded from listings and retrieval
    Pruned { at: DateTime<Utc> },
    /// Folded into `into` by consolidation
    Merged { into: NodeId, at: DateTime<Utc> },
}

impl Lifecycle {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Visible to listings and retrieval (Active or Decayed)
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Decayed { .. })
    }

    /// Pruned or Merged; no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Pruned { .. } | Self::Merged { .. })
    }

    pub fn is_decayed(&self) -> bool {
        matches!(self, Self::Decayed { .. })
    }

    /// Survivor id if this record was merged
    pub fn merged_into(&self) -> Option<NodeId> {
        match self {
            Self::Merged { into, .. } => Some(*into),
            _ => None,
        }
    }

    /// How long the record has been Decayed at `now`
    pub fn decayed_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Self::Decayed { since } => Some(now - *since),
            _ => None,
        }
    }

    /// Decayed for at least `window`
    pub fn retention_elapsed(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.decayed_for(now).map(|d| d >= window).unwrap_or(false)
    }

    /// Short label for stats and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Decayed { .. } => "decayed",
            Self::Pruned { .. } => "pruned",
            Self::Merged { .. } => "merged",
        }
    }
}

/// Merge redirect kept for a grace period so in-flight references to a
/// merged node can be re-resolved to its survivor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRedirect {
    pub from: NodeId,
    pub to: NodeId,
    pub created_at: DateTime<Utc>,
}

impl MergeRedirect {
    pub fn new(from: NodeId, to: NodeId, created_at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            created_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now - self.created_at > grace
    }
}

/// Instant at which a score decaying as `value * exp(-λ t)` from `as_of`
/// drops below `floor`. `None` when it never does (λ = 0 or value already
/// at or below the floor is handled by the caller).
pub fn crossing_time(
    value: f32,
    floor: f32,
    rate_per_day: f64,
    as_of: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if value <= floor {
        return Some(as_of);
    }
    if rate_per_day <= 0.0 || floor <= 0.0 {
        return None;
    }
    let days = (value as f64 / floor as f64).ln() / rate_per_day;
    let millis = (days * 86_400_000.0).round() as i64;
    Some(as_of + Duration::milliseconds(millis))
}
